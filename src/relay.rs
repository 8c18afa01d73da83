//! Stream Orchestrator
//!
//! Owns one upstream stream per turn, forwards text deltas as they arrive,
//! dispatches tool calls through the [`ToolRegistry`], and always ends the
//! downstream stream with exactly one `done` frame.

use crate::constants::{
    CHART_COMPLETE_MESSAGE, CHART_ERROR_MESSAGE, CHART_TOOL_NAME, TOOL_START_DESCRIPTION,
};
use crate::conversation::{map_conversation, RawMessage};
use crate::events::{StreamEvent, ToolComplete, ToolError, ToolStart};
use crate::json_repair::is_json_complete;
use crate::logging::{panic_message, TurnMetric};
use crate::markers;
use crate::tools::ToolRegistry;
use crate::types::{ChatMessage, RelayError, Result, Role, ToolCallId};
use crate::upstream::{CompletionRequest, ToolCallDelta, UpstreamClient};
use futures_util::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Write half of one turn's downstream transport.
///
/// Not `Clone`: [`EventSink::close`] consumes it, so the terminal frame is
/// sent once and the channel is released exactly once.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the reader is gone. Frames sent after that are
    /// dropped; the turn itself keeps running to completion.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("Client disconnected, dropping frame");
            return false;
        }
        true
    }

    pub async fn close(self) {
        self.emit(StreamEvent::done()).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingUpstream,
    Streaming,
    ToolDispatch,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    pub history: Vec<RawMessage>,
}

/// One tool call being assembled from indexed upstream fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Collects fragmented tool-call deltas and hands each call out once.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    buffers: BTreeMap<u32, PendingToolCall>,
    dispatched: HashSet<String>,
}

impl ToolCallAssembler {
    /// Merges deltas into their buffers. A delta that reuses an index under a
    /// new id evicts the previous call, which is returned for dispatch.
    pub fn absorb(&mut self, deltas: &[ToolCallDelta]) -> Vec<PendingToolCall> {
        let mut evicted = Vec::new();
        for (position, delta) in deltas.iter().enumerate() {
            let index = delta.index.unwrap_or(position as u32);

            let replaces = match (self.buffers.get(&index), &delta.id) {
                (Some(existing), Some(id)) => &existing.id != id,
                _ => false,
            };
            if replaces {
                if let Some(old) = self.buffers.remove(&index) {
                    evicted.push(old);
                }
            }

            let entry = self.buffers.entry(index).or_insert_with(|| PendingToolCall {
                id: match &delta.id {
                    Some(id) if !id.is_empty() => id.clone(),
                    _ => ToolCallId::new().0,
                },
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    if !name.is_empty() {
                        entry.name = name.clone();
                    }
                }
                entry.arguments.push_str(&function.arguments_text());
            }
        }
        evicted
    }

    /// Removes and returns the calls whose arguments form complete JSON.
    pub fn take_complete(&mut self) -> Vec<PendingToolCall> {
        let ready: Vec<u32> = self
            .buffers
            .iter()
            .filter(|(_, call)| !call.name.is_empty() && is_json_complete(&call.arguments))
            .map(|(index, _)| *index)
            .collect();
        ready
            .into_iter()
            .filter_map(|index| self.buffers.remove(&index))
            .collect()
    }

    /// Removes and returns everything still buffered.
    pub fn drain(&mut self) -> Vec<PendingToolCall> {
        std::mem::take(&mut self.buffers).into_values().collect()
    }

    /// Marks a call id as dispatched; false if it was already dispatched.
    pub fn claim(&mut self, id: &str) -> bool {
        self.dispatched.insert(id.to_string())
    }
}

pub struct Relay {
    upstream: Arc<dyn UpstreamClient>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
}

impl Relay {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            tools,
            system_prompt: system_prompt.into(),
        }
    }

    /// `[system] + bounded history (+ the new user message unless the client
    /// already folded it into the history)`.
    pub fn build_messages(&self, request: &TurnRequest) -> Vec<ChatMessage> {
        let history = map_conversation(&request.history);
        let already_folded = history
            .last()
            .map(|m| m.role == Role::User && m.content == request.message)
            .unwrap_or(false);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history);
        if !already_folded {
            messages.push(ChatMessage::user(request.message.clone()));
        }
        messages
    }

    pub fn completion_request(&self, request: &TurnRequest) -> CompletionRequest {
        let tools = self.tools.manifest();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some("auto".to_string())
        };
        CompletionRequest {
            model: self.upstream.model().to_string(),
            messages: self.build_messages(request),
            stream: true,
            tools,
            tool_choice,
        }
    }

    /// Runs one turn to its end and closes the sink. Never fails: every error
    /// (including a panic inside the turn) becomes an in-stream error message.
    pub async fn run_turn(&self, request: TurnRequest, sink: EventSink) -> TurnState {
        let mut metric = TurnMetric::new();

        let outcome = AssertUnwindSafe(self.drive(&request, &sink, &mut metric))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_payload| {
                Err(RelayError::internal(panic_message(panic_payload.as_ref())).into())
            });

        let state = match outcome {
            Ok(()) => TurnState::Completed,
            Err(e) => {
                tracing::error!("[⚙️ ] Turn failed: {}", e);
                sink.emit(StreamEvent::content(format!("API Error: {}", e.inner)))
                    .await;
                TurnState::Failed
            }
        };

        metric.log_summary(state);
        sink.close().await;
        state
    }

    async fn drive(
        &self,
        request: &TurnRequest,
        sink: &EventSink,
        metric: &mut TurnMetric,
    ) -> Result<()> {
        let mut state = TurnState::AwaitingUpstream;
        let completion = self.completion_request(request);
        tracing::debug!(
            "[⚙️  -> ☁️ ] Opening stream: {} messages, {} tools",
            completion.messages.len(),
            completion.tools.len()
        );

        let mut stream = self.upstream.open_stream(&completion).await?;
        transition(&mut state, TurnState::Streaming);

        let mut assembler = ToolCallAssembler::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            metric.record_chunk(&chunk);

            let Some(choice) = chunk.choices.first() else {
                continue;
            };

            if let Some(text) = &choice.delta.content {
                if !text.is_empty() {
                    sink.emit(StreamEvent::content(text.clone())).await;
                }
            }

            if let Some(deltas) = &choice.delta.tool_calls {
                let mut ready = assembler.absorb(deltas);
                ready.extend(assembler.take_complete());
                if !ready.is_empty() {
                    transition(&mut state, TurnState::ToolDispatch);
                    for call in ready {
                        self.dispatch_tool_call(call, &mut assembler, sink, metric)
                            .await;
                    }
                    transition(&mut state, TurnState::Streaming);
                }
            }

            if let Some(reason) = &choice.finish_reason {
                tracing::debug!("[☁️  -> ⚙️ ] Finish reason: {}", reason);
                self.flush_pending(&mut assembler, sink, metric).await;
                transition(&mut state, TurnState::Completed);
                return Ok(());
            }
        }

        tracing::warn!("[☁️  -> ⚙️ ] Upstream stream ended without a finish reason");
        self.flush_pending(&mut assembler, sink, metric).await;
        transition(&mut state, TurnState::Completed);
        Ok(())
    }

    async fn flush_pending(
        &self,
        assembler: &mut ToolCallAssembler,
        sink: &EventSink,
        metric: &mut TurnMetric,
    ) {
        for call in assembler.drain() {
            if call.name.is_empty() {
                tracing::warn!("[⚙️ ] Dropping nameless tool call {}", call.id);
                continue;
            }
            self.dispatch_tool_call(call, assembler, sink, metric).await;
        }
    }

    /// `tool_start` → handler → `tool_complete` | `tool_error`. Failures stay
    /// inside this triplet and never end the turn.
    async fn dispatch_tool_call(
        &self,
        call: PendingToolCall,
        assembler: &mut ToolCallAssembler,
        sink: &EventSink,
        metric: &mut TurnMetric,
    ) {
        if !assembler.claim(&call.id) {
            tracing::warn!("[⚙️ ] Tool call {} already dispatched, ignoring", call.id);
            return;
        }
        metric.record_tool_call(&call.name);
        tracing::info!("[⚙️ ] Dispatching tool {} ({})", call.name, call.id);

        sink.emit(StreamEvent::ToolStart(ToolStart {
            id: call.id.clone(),
            name: call.name.clone(),
            description: TOOL_START_DESCRIPTION.to_string(),
        }))
        .await;

        let result = AssertUnwindSafe(self.tools.dispatch(&call.name, &call.arguments, sink))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_payload| {
                Err(RelayError::Tool {
                    name: call.name.clone(),
                    message: panic_message(panic_payload.as_ref()),
                }
                .into())
            });

        match result {
            Ok(args) => {
                sink.emit(StreamEvent::ToolComplete(ToolComplete {
                    name: call.name.clone(),
                    message: Some(completion_message(&call.name)),
                }))
                .await;
                if call.name == CHART_TOOL_NAME {
                    sink.emit(StreamEvent::content(markers::chart_marker(&args)))
                        .await;
                }
            }
            Err(e) => {
                metric.record_tool_failure();
                tracing::warn!("[⚙️ ] Tool {} failed: {}", call.name, e.inner);
                sink.emit(StreamEvent::ToolError(ToolError {
                    name: call.name.clone(),
                    message: Some(failure_message(&call.name)),
                    error: Some(e.inner.to_string()),
                }))
                .await;
            }
        }
    }
}

fn transition(state: &mut TurnState, next: TurnState) {
    if *state != next {
        tracing::trace!("[⚙️ ] Turn state {:?} -> {:?}", state, next);
        *state = next;
    }
}

fn completion_message(tool_name: &str) -> String {
    if tool_name == CHART_TOOL_NAME {
        CHART_COMPLETE_MESSAGE.to_string()
    } else {
        format!("{} completed", tool_name)
    }
}

fn failure_message(tool_name: &str) -> String {
    if tool_name == CHART_TOOL_NAME {
        CHART_ERROR_MESSAGE.to_string()
    } else {
        format!("Error running {}", tool_name)
    }
}
