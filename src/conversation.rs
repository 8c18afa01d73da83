//! Upstream Conversation Mapper
//!
//! Turns client-supplied history into the upstream message list: only
//! `user`/`assistant` entries with non-blank content survive, structured
//! content is flattened to its JSON text, and only the most recent
//! [`MAX_HISTORY_MESSAGES`] entries are kept.

use crate::constants::MAX_HISTORY_MESSAGES;
use crate::types::{ChatMessage, Role};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A history entry exactly as the client sent it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
}

impl RawMessage {
    pub fn new(role: &str, content: impl Into<Value>) -> Self {
        Self {
            role: Some(role.to_string()),
            content: Some(content.into()),
        }
    }

    /// Reads an entry of any JSON shape. Non-objects and non-string roles
    /// yield an entry the mapper drops.
    pub fn from_loose(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let role = match fields.remove("role") {
            Some(Value::String(role)) => Some(role),
            _ => None,
        };
        Self {
            role,
            content: fields.remove("content"),
        }
    }

    fn qualifying_role(&self) -> Option<Role> {
        match self.role.as_deref() {
            Some("user") => Some(Role::User),
            Some("assistant") => Some(Role::Assistant),
            _ => None,
        }
    }

    fn text_content(&self) -> Option<String> {
        let text = match self.content.as_ref()? {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "loose_history")]
    pub messages: Vec<RawMessage>,
}

/// `null` or a non-array is an empty history; entries are read with
/// [`RawMessage::from_loose`].
fn loose_history<'de, D>(deserializer: D) -> std::result::Result<Vec<RawMessage>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(entries) => entries.into_iter().map(RawMessage::from_loose).collect(),
        _ => Vec::new(),
    })
}

pub fn map_conversation(raw: &[RawMessage]) -> Vec<ChatMessage> {
    let mapped: Vec<ChatMessage> = raw
        .iter()
        .filter_map(|m| {
            let role = m.qualifying_role()?;
            let content = m.text_content()?;
            Some(ChatMessage { role, content })
        })
        .collect();

    let dropped = mapped.len().saturating_sub(MAX_HISTORY_MESSAGES);
    if dropped > 0 {
        tracing::debug!(
            "[🖥️  -> ⚙️ ] History bounded: dropping {} oldest messages",
            dropped
        );
    }
    mapped.into_iter().skip(dropped).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters_roles_and_blank_content() {
        let raw = vec![
            RawMessage::new("system", "ignore me"),
            RawMessage::new("user", "Hi"),
            RawMessage::new("assistant", "   "),
            RawMessage::new("tool", "{}"),
            RawMessage {
                role: None,
                content: Some(json!("no role")),
            },
            RawMessage {
                role: Some("user".into()),
                content: None,
            },
            RawMessage::new("assistant", "Hello!"),
        ];
        let mapped = map_conversation(&raw);
        assert_eq!(
            mapped,
            vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello!")]
        );
    }

    #[test]
    fn test_structured_content_is_serialized() {
        let raw = vec![RawMessage::new("user", json!({"parts": ["a", "b"]}))];
        let mapped = map_conversation(&raw);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].content, r#"{"parts":["a","b"]}"#);
    }

    #[test]
    fn test_keeps_most_recent_forty_in_order() {
        let raw: Vec<RawMessage> = (0..55)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                RawMessage::new(role, format!("m{}", i))
            })
            .collect();
        let mapped = map_conversation(&raw);
        assert_eq!(mapped.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(mapped[0].content, "m15");
        assert_eq!(mapped[39].content, "m54");
    }

    #[test]
    fn test_does_not_enforce_alternation() {
        let raw = vec![RawMessage::new("user", "one"), RawMessage::new("user", "two")];
        assert_eq!(map_conversation(&raw).len(), 2);
    }

    #[test]
    fn test_request_tolerates_badly_typed_history() {
        let request: ChatRequest = serde_json::from_value(json!({
            "message": "hi",
            "messages": [
                {"role": 1, "content": "numeric role"},
                null,
                "just a string",
                {"role": ["user"], "content": "array role"},
                {"role": "assistant", "content": "kept"}
            ]
        }))
        .unwrap();
        assert_eq!(request.messages.len(), 5);
        assert_eq!(
            map_conversation(&request.messages),
            vec![ChatMessage::assistant("kept")]
        );

        for messages in [json!(null), json!("nope"), json!({})] {
            let request: ChatRequest =
                serde_json::from_value(json!({"message": "hi", "messages": messages})).unwrap();
            assert!(request.messages.is_empty());
        }
    }

    #[test]
    fn test_deserializes_loose_client_payloads() {
        let raw: Vec<RawMessage> = serde_json::from_value(json!([
            {"role": "user", "content": "a", "id": "x"},
            {"content": 42},
            {"role": "assistant", "content": 3.5}
        ]))
        .unwrap();
        let mapped = map_conversation(&raw);
        assert_eq!(mapped, vec![ChatMessage::user("a"), ChatMessage::assistant("3.5")]);
    }
}
