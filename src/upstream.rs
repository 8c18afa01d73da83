//! Upstream model client.
//!
//! The relay never reaches for a global client: an [`UpstreamClient`] value is
//! built once at startup and handed to every turn.

use crate::hardening::RetryPolicy;
use crate::str_utils;
use crate::tools::ToolDefinition;
use crate::types::{ChatMessage, ObservedError, RelayError, Result};
use async_trait::async_trait;
use futures_util::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// --- REQUEST ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// --- PROVIDER WIRE TYPES ---

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, alias = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, alias = "toolCalls", skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    /// Usually a JSON string fragment; some providers send a full object.
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

impl FunctionDelta {
    pub fn arguments_text(&self) -> String {
        match &self.arguments {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct UpstreamErrorBody {
    pub error: UpstreamErrorDetails,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct UpstreamErrorDetails {
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum LineEvent {
    Chunk(UpstreamChunk),
    Error(UpstreamErrorBody),
    Done,
    Unknown(String),
}

pub fn parse_upstream_line(line: &str) -> LineEvent {
    let data = match line.strip_prefix("data:") {
        Some(d) => d.trim(),
        None => return LineEvent::Unknown(line.to_string()),
    };
    if data == "[DONE]" {
        return LineEvent::Done;
    }
    // Error first: it is the more specific shape
    if let Ok(err) = serde_json::from_str::<UpstreamErrorBody>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<UpstreamChunk>(data) {
        if !chunk.choices.is_empty() || chunk.usage.is_some() {
            return LineEvent::Chunk(chunk);
        }
    }
    tracing::debug!(
        "[☁️  -> ⚙️ ] Unknown line format: {}",
        str_utils::first_n_chars_lossy(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}

impl UpstreamErrorBody {
    fn into_error(self) -> ObservedError {
        let status = self
            .error
            .code
            .as_ref()
            .and_then(|c| match c {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|c| u16::try_from(c).ok())
            .and_then(|c| axum::http::StatusCode::from_u16(c).ok())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        RelayError::Upstream(status, self.error.message).into()
    }
}

/// --- CLIENT ---

pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<UpstreamChunk>> + Send>>;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn model(&self) -> &str;
    async fn open_stream(&self, request: &CompletionRequest) -> Result<UpstreamStream>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl HttpUpstream {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            retry,
        }
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(RelayError::Network)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("Upstream error (body unreadable): {}", e),
        };
        tracing::error!(
            "[☁️  -> ⚙️ ] Upstream rejected request ({}): {}",
            status,
            str_utils::first_n_chars_lossy(&error_body, 300)
        );
        Err(RelayError::Upstream(status, error_body).into())
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    fn model(&self) -> &str {
        &self.model
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<UpstreamStream> {
        let response = self
            .retry
            .execute_with_retry(|| self.send_once(request))
            .await?;
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", response.status());

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(chunk_stream(bytes_stream)))
    }
}

/// Turns a raw SSE byte stream from the provider into parsed chunks,
/// stopping at `data: [DONE]`.
pub fn chunk_stream<R>(bytes: R) -> impl Stream<Item = Result<UpstreamChunk>> + Send
where
    R: Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> + Send + Unpin,
{
    FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(1024 * 1024),
    )
    .map(classify_line)
    .take_while(|event| future::ready(!matches!(event, Some(LineEvent::Done))))
    .filter_map(|event| {
        future::ready(match event {
            Some(LineEvent::Chunk(chunk)) => Some(Ok(chunk)),
            Some(LineEvent::Error(err)) => Some(Err(err.into_error())),
            Some(LineEvent::Unknown(_)) | Some(LineEvent::Done) => None,
            None => Some(Err(RelayError::Protocol(
                "Upstream line exceeded maximum length".to_string(),
            )
            .into())),
        })
    })
}

fn classify_line(line: std::result::Result<String, LinesCodecError>) -> Option<LineEvent> {
    match line {
        Ok(line) if line.trim().is_empty() || line.starts_with(':') => {
            Some(LineEvent::Unknown(line))
        }
        Ok(line) => Some(parse_upstream_line(&line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => None,
        Err(LinesCodecError::Io(e)) => Some(LineEvent::Error(UpstreamErrorBody {
            error: UpstreamErrorDetails {
                message: format!("Upstream stream interrupted: {}", e),
                code: None,
            },
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    #[test]
    fn test_parse_chunk_with_text_delta() {
        let line = r#"data: {"id":"123","model":"mistral-large-latest","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        match parse_upstream_line(line) {
            LineEvent::Chunk(c) => {
                assert_eq!(c.id, "123");
                assert_eq!(c.choices[0].delta.content.as_deref(), Some("Hello"));
            }
            other => panic!("Expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_call_with_object_arguments() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"id":"abc","index":0,"function":{"name":"generate_chart","arguments":{"type":"bar"}}}]},"finish_reason":"tool_calls"}]}"#;
        match parse_upstream_line(line) {
            LineEvent::Chunk(c) => {
                let calls = c.choices[0].delta.tool_calls.clone().unwrap();
                let function = calls[0].function.clone().unwrap();
                assert_eq!(function.arguments_text(), r#"{"type":"bar"}"#);
                assert_eq!(c.choices[0].finish_reason.as_deref(), Some("tool_calls"));
            }
            other => panic!("Expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_and_done() {
        match parse_upstream_line(r#"data: {"error":{"message":"Overloaded","code":503}}"#) {
            LineEvent::Error(e) => {
                let err = e.into_error();
                match err.inner {
                    RelayError::Upstream(status, msg) => {
                        assert_eq!(status.as_u16(), 503);
                        assert_eq!(msg, "Overloaded");
                    }
                    other => panic!("Expected upstream error, got {:?}", other),
                }
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert!(matches!(parse_upstream_line("data: [DONE]"), LineEvent::Done));
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_at_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            ": ping\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        );
        let input = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
        let chunks: Vec<UpstreamChunk> = chunk_stream(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
