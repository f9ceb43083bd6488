//! Chat store integration hook
//!
//! When an instance's context carries a chat id, the engine mirrors its
//! conversational surface into a chat store: every suspend prompt and
//! final result goes out as an assistant event, and resume input goes out
//! as a user event before the executor re-enters. The emission belongs to
//! the engine; step bodies must not duplicate it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Author of a chat event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Engine-produced content (prompts, final results)
    Assistant,

    /// Resume input supplied by the user
    User,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assistant => write!(f, "assistant"),
            Self::User => write!(f, "user"),
        }
    }
}

/// One event mirrored to the chat store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Chat the instance is bound to
    pub chat_id: String,

    /// User the instance is bound to, if known
    pub user_id: Option<String>,

    /// Who authored the event
    pub role: ChatRole,

    /// Prompt, final result, or resume input
    pub payload: serde_json::Value,

    /// Schema identifier propagated verbatim from the suspension metadata
    pub schema: Option<String>,
}

impl ChatEvent {
    /// Create an assistant event
    pub fn assistant(chat_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: None,
            role: ChatRole::Assistant,
            payload,
            schema: None,
        }
    }

    /// Create a user event
    pub fn user(chat_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: None,
            role: ChatRole::User,
            payload,
            schema: None,
        }
    }

    /// Attach the user binding
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Attach a schema identifier
    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }
}

/// Collaborator that records chat events
///
/// The engine treats the store as a side-effect bridge: failures are
/// logged and never fail the instance.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Append one event to the chat
    async fn append(&self, event: ChatEvent) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_construction() {
        let event = ChatEvent::assistant("chat-1", json!({ "q": "name?" }))
            .with_user(Some("u-7".into()))
            .with_schema(Some("name_form".into()));

        assert_eq!(event.role, ChatRole::Assistant);
        assert_eq!(event.chat_id, "chat-1");
        assert_eq!(event.user_id.as_deref(), Some("u-7"));
        assert_eq!(event.schema.as_deref(), Some("name_form"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
        assert_eq!(ChatRole::User.to_string(), "user");
    }
}
