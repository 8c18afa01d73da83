use crate::constants::TURN_ID_HEADER;
use crate::relay::TurnState;
use crate::upstream::{UpstreamChunk, Usage};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use colored::*;
use std::any::Any;
use std::panic;
use std::path::Path;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const DEFAULT_LOG_FILTER: &str = "chartrelay=info";
pub const LOG_FILE_NAME: &str = "chartrelay.log";

/// Installs the global subscriber: a daily-rotated NDJSON file under
/// `log_dir`, human-readable stderr when `console` is set, and span traces
/// for [`crate::types::ObservedError`].
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_tracing(log_dir: &Path, console: bool) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Could not create log directory {}: {}", log_dir.display(), e);
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(console.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let message = panic_message(panic_info.payload());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Best-effort text of a panic payload (`panic!` with a literal or a formatted message).
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

/// Tags every request with a fresh turn id: recorded on the request span,
/// forwarded to handlers as a header and echoed back on the response.
pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&turn_id).ok();
    if let Some(val) = header.clone() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        turn_id = %turn_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(TURN_ID_HEADER, val);
    }
    response
}

/// Per-turn counters, logged once when the turn ends.
#[derive(Default)]
pub struct TurnMetric {
    pub chunks: usize,
    pub text_chars: usize,
    pub tool_calls: usize,
    pub tool_failures: usize,
    pub tool_names: Vec<String>,
    pub usage: Option<Usage>,
    started: Option<std::time::Instant>,
}

impl TurnMetric {
    pub fn new() -> Self {
        Self {
            started: Some(std::time::Instant::now()),
            ..Self::default()
        }
    }

    pub fn record_chunk(&mut self, chunk: &UpstreamChunk) {
        self.chunks += 1;
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.chars().count();
            }
        }
    }

    pub fn record_tool_call(&mut self, name: &str) {
        self.tool_calls += 1;
        self.tool_names.push(name.to_string());
    }

    pub fn record_tool_failure(&mut self) {
        self.tool_failures += 1;
    }

    pub fn log_summary(&self, state: TurnState) {
        let elapsed_ms = self
            .started
            .map(|s| s.elapsed().as_millis())
            .unwrap_or_default();
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_calls)
        } else {
            format!("{} ({})", self.tool_calls, self.tool_names.join(", "))
        };
        let tokens = self
            .usage
            .as_ref()
            .map(|u| u.total_tokens.to_string())
            .unwrap_or_else(|| "-".to_string());

        if self.tool_failures > 0 {
            warn!(
                target: "flight_recorder",
                "{}",
                format!("[TOOLS] {} of {} tool calls failed", self.tool_failures, self.tool_calls)
                    .yellow()
            );
        }

        info!(
            target: "flight_recorder",
            "[TURN END] State: {:?} | Chunks: {} | Tools: {} | Text: {} chars | Tokens: {} | {} ms",
            state, self.chunks, tools_str, self.text_chars, tokens, elapsed_ms
        );
    }
}
