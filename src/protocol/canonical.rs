use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parse a wire role. Unknown roles yield `None` and the message is dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single part of a message's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    /// Reference to a file the backend already stores; bytes never travel here.
    FileRef {
        id: String,
        filename: Option<String>,
    },
}

/// One normalized conversation message. `content` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Part>,
}

impl Message {
    /// Concatenate the text parts in order and trim the result.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let Part::Text(text) = part {
                out.push_str(text);
            }
        }
        let trimmed = out.trim();
        if trimmed.len() == out.len() {
            out
        } else {
            trimmed.to_owned()
        }
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.content.iter().filter_map(|part| match part {
            Part::FileRef { id, .. } => Some(id.as_str()),
            Part::Text(_) => None,
        })
    }
}

/// One callable capability advertised by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A discovered tool/capability server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "capabilitySpecs")]
    pub specs: Vec<CapabilitySpec>,
}

impl ToolServerDescriptor {
    /// Only descriptors with a url and at least one spec are worth sending.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.url.trim().is_empty() && !self.specs.is_empty()
    }
}

/// Keep only usable descriptors, preserving order.
#[must_use]
pub fn retain_usable(servers: Vec<ToolServerDescriptor>) -> Vec<ToolServerDescriptor> {
    servers
        .into_iter()
        .filter(ToolServerDescriptor::is_usable)
        .collect()
}

/// The fixed vocabulary of stream events sent downstream, independent of the
/// upstream wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    StreamStart,
    StepStart,
    TextStart { id: Arc<str> },
    TextDelta { id: Arc<str>, delta: String },
    ToolCall { id: Arc<str>, calls: Vec<serde_json::Value> },
    TextEnd { id: Arc<str> },
    StepFinish,
    StreamFinish,
    StreamDone,
    /// Mid-stream transport failure; the stream closes after it without `StreamDone`.
    Error { message: String },
}

impl CanonicalEvent {
    /// Downstream `type` tag; `None` for the bare `[DONE]` terminator.
    #[must_use]
    pub fn wire_type(&self) -> Option<&'static str> {
        match self {
            CanonicalEvent::StreamStart => Some("start"),
            CanonicalEvent::StepStart => Some("start-step"),
            CanonicalEvent::TextStart { .. } => Some("text-start"),
            CanonicalEvent::TextDelta { .. } => Some("text-delta"),
            CanonicalEvent::ToolCall { .. } => Some("tool-call"),
            CanonicalEvent::TextEnd { .. } => Some("text-end"),
            CanonicalEvent::StepFinish => Some("finish-step"),
            CanonicalEvent::StreamFinish => Some("finish"),
            CanonicalEvent::Error { .. } => Some("error"),
            CanonicalEvent::StreamDone => None,
        }
    }
}
