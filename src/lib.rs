#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod conversation;
pub mod events;
pub mod hardening;
pub mod health;
pub mod json_repair;
pub mod logging;
pub mod markers;
pub mod prompt;
pub mod relay;
pub mod server;
pub mod store;
pub mod str_utils;
pub mod tools;
pub mod types;
pub mod upstream;

pub use types::*;

pub use server::AppState;
