#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::StatusCode;
use chartrelay::events::StreamEvent;
use chartrelay::relay::{EventSink, Relay, TurnRequest, TurnState};
use chartrelay::tools::{ChartTool, ToolRegistry};
use chartrelay::types::{RelayError, Result};
use chartrelay::upstream::{
    ChunkChoice, ChunkDelta, CompletionRequest, FunctionDelta, ToolCallDelta, UpstreamChunk,
    UpstreamClient, UpstreamStream,
};
use futures_util::stream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub enum Step {
    Chunk(UpstreamChunk),
    Fail(String),
}

/// Replays a fixed script of upstream chunks for every turn and records the
/// requests it was opened with.
pub struct ScriptedUpstream {
    steps: Vec<Step>,
    reject_with: Option<StatusCode>,
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedUpstream {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            reject_with: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rejecting(status: StatusCode) -> Self {
        Self {
            reject_with: Some(status),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<UpstreamStream> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(status) = self.reject_with {
            return Err(RelayError::Upstream(status, "Service Unavailable".to_string()).into());
        }
        let items: Vec<Result<UpstreamChunk>> = self
            .steps
            .iter()
            .map(|step| match step {
                Step::Chunk(chunk) => Ok(chunk.clone()),
                Step::Fail(message) => Err(RelayError::Protocol(message.clone()).into()),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

pub fn text(content: &str) -> Step {
    Step::Chunk(UpstreamChunk {
        choices: vec![ChunkChoice {
            delta: ChunkDelta {
                content: Some(content.to_string()),
                tool_calls: None,
            },
            ..ChunkChoice::default()
        }],
        ..UpstreamChunk::default()
    })
}

pub fn finish(reason: &str) -> Step {
    Step::Chunk(UpstreamChunk {
        choices: vec![ChunkChoice {
            finish_reason: Some(reason.to_string()),
            ..ChunkChoice::default()
        }],
        ..UpstreamChunk::default()
    })
}

pub fn tool_call(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> Step {
    Step::Chunk(UpstreamChunk {
        choices: vec![ChunkChoice {
            delta: ChunkDelta {
                content: None,
                tool_calls: Some(vec![ToolCallDelta {
                    index: Some(index),
                    id: id.map(str::to_string),
                    function: Some(FunctionDelta {
                        name: name.map(str::to_string),
                        arguments: Some(serde_json::Value::String(arguments.to_string())),
                    }),
                }]),
            },
            ..ChunkChoice::default()
        }],
        ..UpstreamChunk::default()
    })
}

pub const BAR_CHART_ARGS: &str =
    r#"{"type":"bar","title":"Sales","data":[{"label":"Q1","value":10},{"label":"Q2","value":12}]}"#;

pub fn instant_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ChartTool::new(Duration::ZERO)));
    registry
}

pub fn relay_with(upstream: ScriptedUpstream) -> Relay {
    Relay::new(Arc::new(upstream), Arc::new(instant_tools()), "You are a test assistant.")
}

/// Runs one turn and collects every frame it produced.
pub async fn run_collect(relay: &Relay, message: &str) -> (TurnState, Vec<StreamEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let state = relay
        .run_turn(
            TurnRequest {
                message: message.to_string(),
                history: Vec::new(),
            },
            EventSink::new(tx),
        )
        .await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (state, events)
}

pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}
