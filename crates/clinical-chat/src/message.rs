//! Chat message model shared by history, live streaming and reconciliation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Normalize a role string coming from a persisted store.
    ///
    /// Returns `None` for roles that never reach the display layer
    /// (summaries, tool calls and other bookkeeping rows).
    pub fn normalize(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" | "bot" | "model" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One typed piece of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// Any part kind this crate does not interpret; kept verbatim.
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, MessagePart::Text { .. })
    }
}

/// Where a message came from. Only used for reconciliation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Persisted,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(skip)]
    pub origin: Origin,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<MessagePart>, origin: Origin) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
            origin,
        }
    }

    /// Fresh live message with a random id and a single text part.
    pub fn live(role: Role, text: impl Into<String>) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            role,
            vec![MessagePart::text(text)],
            Origin::Live,
        )
    }

    /// Concatenation of all text parts. Other kinds are ignored.
    pub fn text(&self) -> String {
        self.parts.iter().fold(String::new(), |mut acc, part| {
            if let MessagePart::Text { text } = part {
                acc.push_str(text);
            }
            acc
        })
    }

    /// Append streamed text to the trailing text part, creating one if needed.
    pub fn append_text(&mut self, delta: &str) {
        match self.parts.last_mut() {
            Some(MessagePart::Text { text }) => text.push_str(delta),
            _ => self.parts.push(MessagePart::text(delta)),
        }
    }
}
