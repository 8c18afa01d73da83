//! Chat session and relay client.
//!
//! [`ChatSession`] owns one conversation's message list. Every change is
//! published as a fresh [`SessionSnapshot`] on a `watch` channel, so
//! renderers never observe a half-updated list.

use crate::constants::{CHAT_ENDPOINT, FALLBACK_ERROR_MESSAGE};
use crate::consumer::{consume_stream, Message, MessageDraft, StreamEnd};
use crate::conversation::{ChatRequest, RawMessage};
use crate::events::{self, StreamEvent};
use crate::types::{ConversationId, RelayError, Result, Role};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Done,
    Errored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub phase: TurnPhase,
}

pub struct ChatSession {
    id: ConversationId,
    messages: Vec<Message>,
    is_loading: bool,
    is_streaming: bool,
    phase: TurnPhase,
    updates: watch::Sender<SessionSnapshot>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::resume(ConversationId::new(), Vec::new())
    }

    pub fn resume(id: ConversationId, messages: Vec<Message>) -> Self {
        let (updates, _) = watch::channel(SessionSnapshot {
            messages: messages.clone(),
            ..SessionSnapshot::default()
        });
        Self {
            id,
            messages,
            is_loading: false,
            is_streaming: false,
            phase: TurnPhase::Idle,
            updates,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.is_loading || self.is_streaming
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    fn publish(&self) {
        self.updates.send_replace(SessionSnapshot {
            messages: self.messages.clone(),
            is_loading: self.is_loading,
            is_streaming: self.is_streaming,
            phase: self.phase,
        });
    }

    /// Appends the user message and returns the request to post.
    /// `None` when the text is blank; [`RelayError::Busy`] while a turn is in flight.
    pub fn begin_turn(&mut self, text: &str) -> Result<Option<ChatRequest>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        if self.is_busy() {
            return Err(RelayError::Busy.into());
        }

        let history = self
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| RawMessage::new(role_name(m.role), m.content.clone()))
            .collect();

        self.messages.push(Message::new(Role::User, text));
        self.is_loading = true;
        self.phase = TurnPhase::Sending;
        self.publish();

        Ok(Some(ChatRequest {
            message: Some(text.to_string()),
            messages: history,
        }))
    }

    /// Folds the reply stream into a new assistant message.
    pub async fn stream_reply<S>(&mut self, events: S) -> TurnPhase
    where
        S: Stream<Item = Result<StreamEvent>>,
    {
        let mut draft = MessageDraft::new(uuid::Uuid::new_v4().to_string());
        self.messages.push(draft.to_message());
        self.is_loading = false;
        self.is_streaming = true;
        self.phase = TurnPhase::Streaming;
        self.publish();

        let outcome = consume_stream(events, &mut draft, |d| {
            if let Some(last) = self.messages.last_mut() {
                *last = d.to_message();
            }
            self.publish();
        })
        .await;

        match outcome {
            Ok(end) => {
                if end == StreamEnd::Eof {
                    tracing::warn!("[⚙️  -> 🖥️ ] Reply ended without done frame");
                }
                if let Some(last) = self.messages.last_mut() {
                    *last = draft.to_message();
                }
                self.phase = TurnPhase::Done;
                self.publish();
                TurnPhase::Done
            }
            Err(e) => {
                tracing::error!("[⚙️  -> 🖥️ ] Reading reply failed: {}", e);
                if draft.is_empty() {
                    self.messages.pop();
                } else if let Some(last) = self.messages.last_mut() {
                    *last = draft.to_message();
                }
                self.fail_turn();
                TurnPhase::Errored
            }
        }
    }

    /// Appends the single fallback error message for this turn.
    pub fn fail_turn(&mut self) {
        self.messages
            .push(Message::new(Role::Assistant, FALLBACK_ERROR_MESSAGE));
        self.phase = TurnPhase::Errored;
        self.publish();
    }

    /// Clears the busy flags whatever the turn's outcome.
    pub fn end_turn(&mut self) {
        self.is_loading = false;
        self.is_streaming = false;
        self.publish();
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Posts turns to a relay server.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, server: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}{}", server.trim_end_matches('/'), CHAT_ENDPOINT),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs one full turn. Returns [`TurnPhase::Idle`] when the text was blank.
    pub async fn send_message(&self, session: &mut ChatSession, text: &str) -> Result<TurnPhase> {
        let Some(request) = session.begin_turn(text)? else {
            return Ok(TurnPhase::Idle);
        };

        let phase = match self.post(&request).await {
            Ok(response) => {
                let bytes = response
                    .bytes_stream()
                    .map(|r| r.map_err(std::io::Error::other));
                session.stream_reply(events::decode_stream(bytes)).await
            }
            Err(e) => {
                tracing::error!("[🖥️  -> ⚙️ ] Chat request failed: {}", e);
                session.fail_turn();
                TurnPhase::Errored
            }
        };

        session.end_turn();
        Ok(phase)
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream(status, body).into());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_message_is_ignored() {
        let mut session = ChatSession::new();
        assert!(session.begin_turn("   ").unwrap().is_none());
        assert!(session.messages().is_empty());
        assert!(!session.is_busy());
    }

    #[test]
    fn test_busy_session_rejects_second_turn() {
        let mut session = ChatSession::new();
        let request = session.begin_turn("hi").unwrap().unwrap();
        assert_eq!(request.message.as_deref(), Some("hi"));
        assert!(request.messages.is_empty());

        let err = session.begin_turn("again").unwrap_err();
        assert!(matches!(err.inner, RelayError::Busy));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn test_history_excludes_new_message() {
        let mut session = ChatSession::resume(
            ConversationId::from("c1".to_string()),
            vec![
                Message::new(Role::User, "first"),
                Message::new(Role::Assistant, "answer"),
            ],
        );
        let request = session.begin_turn("second").unwrap().unwrap();
        assert_eq!(
            request.messages,
            vec![
                RawMessage::new("user", "first"),
                RawMessage::new("assistant", "answer"),
            ]
        );
        assert_eq!(session.messages().len(), 3);
    }

    #[test]
    fn test_endpoint_joins_server_url() {
        let client = ChatClient::new(reqwest::Client::new(), "http://localhost:3000/");
        assert_eq!(client.endpoint(), "http://localhost:3000/api/chat");
    }
}
