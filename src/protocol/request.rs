//! Inbound chat-turn bodies and the outbound completion request.
//!
//! Inbound messages arrive in three shapes: a flat `content` string, a
//! `content` part array, or a `parts` array. All three collapse into
//! [`Message`] through [`normalize_message`].

use serde::{Deserialize, Serialize};

use crate::protocol::canonical::{Message, Part, Role, ToolServerDescriptor};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatTurnRequest {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default, rename = "fileIds", alias = "file_ids")]
    pub file_ids: Vec<String>,
    #[serde(default, alias = "toolServers")]
    pub tool_servers: Vec<ToolServerDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<InboundContent>,
    #[serde(default)]
    pub parts: Option<Vec<InboundPart>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<InboundPart>),
    Other(serde_json::Value),
}

/// One loosely-typed inbound content part.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default, alias = "fileId", alias = "file_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

// Attachment reference embedded as JSON in a file part's `url`/`data`.
#[derive(Debug, Deserialize)]
struct EmbeddedFileRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl InboundPart {
    fn normalize(&self) -> Option<Part> {
        match self.kind.as_str() {
            "text" => {
                let text = self
                    .text
                    .as_deref()
                    .or_else(|| self.content.as_ref().and_then(serde_json::Value::as_str))?;
                (!text.is_empty()).then(|| Part::Text(text.to_owned()))
            }
            "file" => self.normalize_file(),
            _ => None,
        }
    }

    fn normalize_file(&self) -> Option<Part> {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Some(Part::FileRef {
                id: id.to_owned(),
                filename: self.filename.clone().or_else(|| self.name.clone()),
            });
        }

        let embedded = [self.url.as_deref(), self.data.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|raw| serde_json::from_str::<EmbeddedFileRef>(raw).ok())?;
        let id = embedded.id.filter(|id| !id.trim().is_empty())?;
        Some(Part::FileRef {
            id,
            filename: self
                .filename
                .clone()
                .or_else(|| self.name.clone())
                .or(embedded.name),
        })
    }
}

fn normalize_parts(parts: &[InboundPart]) -> Vec<Part> {
    parts.iter().filter_map(InboundPart::normalize).collect()
}

/// Collapse one inbound message into canonical form.
///
/// A non-empty `parts` array wins over `content`. Returns `None` for unknown
/// roles and for messages with neither text nor file references.
#[must_use]
pub fn normalize_message(message: &InboundMessage) -> Option<Message> {
    let role = Role::parse(&message.role)?;
    let content = match (&message.parts, &message.content) {
        (Some(parts), _) if !parts.is_empty() => normalize_parts(parts),
        (_, Some(InboundContent::Text(text))) if !text.is_empty() => {
            vec![Part::Text(text.clone())]
        }
        (_, Some(InboundContent::Parts(parts))) => normalize_parts(parts),
        _ => Vec::new(),
    };
    if content.is_empty() {
        return None;
    }
    Some(Message { role, content })
}

#[must_use]
pub fn normalize_messages(messages: &[InboundMessage]) -> Vec<Message> {
    messages.iter().filter_map(normalize_message).collect()
}

/// Outbound body for the backend completion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<UpstreamMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment<'a>>,
    #[serde(skip_serializing_if = "no_tool_servers")]
    pub tool_servers: &'a [ToolServerDescriptor],
}

fn no_tool_servers(servers: &&[ToolServerDescriptor]) -> bool {
    servers.is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttachment<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
}

/// Build the exact upstream body for one turn.
///
/// Messages whose text normalizes to empty are dropped; `files` and
/// `tool_servers` are attached only when non-empty.
#[must_use]
pub fn build_upstream_request<'a>(
    model: &'a str,
    messages: &[Message],
    file_ids: &'a [String],
    tool_servers: &'a [ToolServerDescriptor],
) -> UpstreamChatRequest<'a> {
    let messages = messages
        .iter()
        .filter_map(|message| {
            let content = message.text();
            (!content.is_empty()).then_some(UpstreamMessage {
                role: message.role,
                content,
            })
        })
        .collect();
    UpstreamChatRequest {
        model,
        messages,
        stream: true,
        files: file_ids
            .iter()
            .map(|id| FileAttachment {
                kind: "file",
                id: id.as_str(),
            })
            .collect(),
        tool_servers,
    }
}
