//! Conversation transcript model shared by voice and text sessions
//!
//! A transcript is an append-only, insertion-ordered list of messages.
//! Messages are immutable once appended.

mod aggregator;

pub use aggregator::{CompletedTurn, TranscriptAggregator, TurnTracker};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between exported turns
const EXPORT_SEPARATOR: &str = "\n-------------------\n\n";

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Label used in plain-text exports and terminal output
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "Candidate",
            Role::Assistant => "SteadyCoach",
        }
    }
}

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Sources the model consulted, as returned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            grounding_metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_grounding(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.grounding_metadata = metadata;
        self
    }

    /// Web sources (title, uri) from the grounding metadata
    pub fn sources(&self) -> Vec<GroundingSource> {
        self.grounding_metadata
            .as_ref()
            .map(grounding_sources)
            .unwrap_or_default()
    }
}

/// A web page the model cited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

/// Extract `groundingChunks[].web` entries
pub fn grounding_sources(metadata: &serde_json::Value) -> Vec<GroundingSource> {
    metadata
        .get("groundingChunks")
        .and_then(|chunks| chunks.as_array())
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.get("web"))
                .filter_map(|web| {
                    let uri = web.get("uri")?.as_str()?.to_string();
                    let title = web
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or(&uri)
                        .to_string();
                    Some(GroundingSource { title, uri })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Append-only ordered message list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Append a message; earlier messages are never touched
    pub fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages excluding the system prompt
    pub fn dialogue(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    /// Plain-text export of the dialogue
    pub fn export_text(&self) -> String {
        self.dialogue()
            .map(|m| format!("[{}]:\n{}\n", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join(EXPORT_SEPARATOR)
    }
}

/// Default file name for an export made on `date`
pub fn export_file_name(date: chrono::NaiveDate) -> String {
    format!("steadycoach-session-{}.txt", date.format("%Y-%m-%d"))
}
