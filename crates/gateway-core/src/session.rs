//! Sessions
//!
//! Durable record of a conversation: an opaque identifier, a title
//! derived from the first user message, the selected model, and an
//! append-only ordered message list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, Role};

/// Unique session identifier (opaque string)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted conversation
///
/// Invariants: message order is append-only and monotonic in time;
/// `updated_at >= created_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Title (derived from the first user message unless set)
    pub title: String,

    /// Model id selected for this session
    pub model: String,

    /// Ordered message history
    pub messages: Vec<Message>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session seeded with its first user message
    pub fn new(first_message: Message, model: impl Into<String>) -> Self {
        let now = Utc::now();
        let title = generate_title(&first_message.content);
        Self {
            id: SessionId::new(),
            title,
            model: model.into(),
            messages: vec![first_message],
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, bumping the activity timestamp
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Short preview of the first user message, for listings
    pub fn preview(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| clamp(&m.content, 100))
            .unwrap_or_default()
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Generate a session title from the first message: the first sentence
/// if it is short enough, otherwise a 50-character clamp.
fn generate_title(first_message: &str) -> String {
    let text = first_message.trim();
    if text.is_empty() {
        return "New chat".into();
    }
    let sentence = text
        .split_inclusive(['.', '?', '!'])
        .next()
        .unwrap_or(text)
        .trim_end_matches(['.', '!'])
        .trim();
    if sentence.chars().count() <= 50 && !sentence.is_empty() {
        sentence.to_string()
    } else {
        clamp(text, 50)
    }
}

fn clamp(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head.trim_end())
    }
}
