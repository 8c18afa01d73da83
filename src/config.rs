use crate::constants::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL, RETRY_BASE_DELAY_MS, UPSTREAM_KEY_ENV};
use crate::hardening::RetryPolicy;
use crate::types::{RelayError, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Directory for the rolling log file
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Chat with a running relay from the terminal
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_size: usize,
}

impl ServeArgs {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, RETRY_BASE_DELAY_MS)
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Base URL of the relay server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub server: String,
    /// JSON file holding saved conversations
    #[arg(long, default_value = "conversations.json")]
    pub store: PathBuf,
    /// Resume a saved conversation by id
    #[arg(long)]
    pub conversation: Option<String>,
}

/// Reads the upstream API key from the environment (`.env` is loaded first by `main`).
pub fn upstream_key() -> Result<String> {
    match std::env::var(UPSTREAM_KEY_ENV) {
        Ok(k) if !k.trim().is_empty() => Ok(k),
        _ => Err(RelayError::InvalidRequest(format!(
            "{} environment variable is missing or empty",
            UPSTREAM_KEY_ENV
        ))
        .into()),
    }
}
