//! HTTP surface: `POST /api/chat` streams one turn back as server-sent events.

use crate::constants::{CHAT_ENDPOINT, SSE_CHANNEL_CAPACITY, SSE_KEEPALIVE_INTERVAL};
use crate::conversation::ChatRequest;
use crate::health;
use crate::logging::turn_id_middleware;
use crate::relay::{EventSink, Relay, TurnRequest};
use crate::types::{RelayError, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::header,
    middleware,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Router,
};
use futures_util::{future, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub struct AppState {
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(relay: Relay) -> Self {
        Self {
            relay: Arc::new(relay),
        }
    }
}

pub fn router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route(CHAT_ENDPOINT, post(chat_handler))
        .route("/health", get(health::liveness))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(turn_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Validation failures answer with a JSON error and open no stream. Once the
/// stream is open every outcome, including upstream failure, arrives as frames.
pub async fn chat_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let request: ChatRequest = serde_json::from_slice(&body)?;
    let message = match request.message {
        Some(m) if !m.trim().is_empty() => m,
        _ => return Err(RelayError::InvalidRequest("Message is required".to_string()).into()),
    };
    tracing::info!(
        "[🖥️  -> ⚙️ ] Chat turn: {} history messages",
        request.messages.len()
    );

    let turn = TurnRequest {
        message,
        history: request.messages,
    };
    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let relay = state.relay.clone();
    tokio::spawn(
        async move {
            relay.run_turn(turn, EventSink::new(tx)).await;
        }
        .instrument(tracing::Span::current()),
    );

    let frames = ReceiverStream::new(rx).filter_map(|event| {
        future::ready(match event.to_sse() {
            Ok(frame) => Some(Ok::<Event, Infallible>(frame)),
            Err(e) => {
                tracing::warn!("[⚙️  -> 🖥️ ] Dropping unencodable {} frame: {}", event.kind(), e);
                None
            }
        })
    });

    Ok((
        [(header::CONNECTION, "keep-alive")],
        Sse::new(frames).keep_alive(
            KeepAlive::new()
                .interval(SSE_KEEPALIVE_INTERVAL)
                .text("keepalive"),
        ),
    )
        .into_response())
}
