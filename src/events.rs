//! Event Envelope Codec
//!
//! Every downstream event is one `data: {json}` line followed by a blank line.
//! The JSON object carries exactly one key naming the event kind, which maps
//! directly onto serde's externally tagged enum representation.

use crate::constants::{FRAME_PREFIX, FRAME_SEPARATOR, MAX_FRAME_LINE_BYTES};
use crate::str_utils;
use crate::types::{ChartPayload, RelayError, Result};
use bytes::Bytes;
use futures_util::{future, Stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    Content(String),
    ToolStart(ToolStart),
    ToolProgress(ToolProgress),
    ToolComplete(ToolComplete),
    ToolHide(ToolHide),
    ToolError(ToolError),
    Chart(ChartPayload),
    Done(DoneFlag),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolStart {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolProgress {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Any JSON number; producers are not held to integers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Number>,
}

impl ToolProgress {
    /// The progress as a whole percentage, clamped to `0..=100`.
    pub fn percent(&self) -> Option<u8> {
        let value = self.progress.as_ref()?.as_f64()?;
        Some(value.clamp(0.0, 100.0).round() as u8)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolComplete {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolHide {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of the terminal frame. Only ever `true` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneFlag;

impl Serialize for DoneFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for DoneFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(DoneFlag)
        } else {
            Err(serde::de::Error::custom("done marker must be true"))
        }
    }
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    pub fn done() -> Self {
        Self::Done(DoneFlag)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content(_) => "content",
            Self::ToolStart(_) => "tool_start",
            Self::ToolProgress(_) => "tool_progress",
            Self::ToolComplete(_) => "tool_complete",
            Self::ToolHide(_) => "tool_hide",
            Self::ToolError(_) => "tool_error",
            Self::Chart(_) => "chart",
            Self::Done(_) => "done",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Converts into an axum SSE event; axum writes it as `data: {json}\n\n`.
    pub fn to_sse(&self) -> Result<axum::response::sse::Event> {
        Ok(axum::response::sse::Event::default().data(self.to_json()?))
    }
}

/// Encodes one event as a self-delimited frame.
pub fn encode(event: &StreamEvent) -> Result<String> {
    Ok(format!("{}{}{}", FRAME_PREFIX, event.to_json()?, FRAME_SEPARATOR))
}

/// Classification of one line of the downstream stream.
#[derive(Debug)]
pub enum FrameLine {
    Event(StreamEvent),
    Malformed { payload: String, reason: String },
    /// Blank separators, keep-alive comments, and other non-data lines
    Ignored,
}

pub fn parse_frame_line(line: &str) -> FrameLine {
    let line = line.trim_end_matches('\r');
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => return FrameLine::Ignored,
    };
    if payload.is_empty() {
        return FrameLine::Ignored;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => FrameLine::Event(event),
        Err(e) => FrameLine::Malformed {
            payload: payload.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Lazily decodes a byte stream into events in arrival order.
///
/// Malformed frames are logged and skipped; only transport failures surface
/// as errors. Frames may be split across chunks arbitrarily.
pub fn decode_stream<R>(bytes: R) -> impl Stream<Item = Result<StreamEvent>>
where
    R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_FRAME_LINE_BYTES),
    )
    .filter_map(|line_result| future::ready(decode_line_result(line_result)))
}

fn decode_line_result(
    line_result: std::result::Result<String, LinesCodecError>,
) -> Option<Result<StreamEvent>> {
    match line_result {
        Ok(line) => match parse_frame_line(&line) {
            FrameLine::Event(event) => Some(Ok(event)),
            FrameLine::Malformed { payload, reason } => {
                tracing::warn!(
                    "[⚙️  -> 🖥️ ] Skipping undecodable frame ({}): {}",
                    reason,
                    str_utils::first_n_chars_lossy(&payload, 120)
                );
                None
            }
            FrameLine::Ignored => None,
        },
        Err(LinesCodecError::MaxLineLengthExceeded) => {
            tracing::warn!("[⚙️  -> 🖥️ ] Skipping frame over {} bytes", MAX_FRAME_LINE_BYTES);
            None
        }
        Err(LinesCodecError::Io(e)) => Some(Err(RelayError::Io(e).into())),
    }
}
