//! Message, content-part, and conversation-context domain types.
//!
//! These are the core value objects the run-loop folds into:
//! the scheduler appends prompts as messages, the stream folder builds the
//! in-flight assistant message part by part, and every provider call reads
//! the full ordered context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::prompt::Prompt;

/// Unique identifier for a session (one run of the agent loop).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
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

/// Unique identifier for a turn (one model call within a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which streamed part kind a delta or end event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Reasoning,
}

impl std::fmt::Display for PartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Reasoning => write!(f, "reasoning"),
        }
    }
}

/// A single content part of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Visible output text.
    Text { text: String },

    /// Model reasoning (thinking) text.
    Reasoning { text: String },

    /// A tool invocation requested by the model.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Output payload of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutput {
    /// The tool returned a value.
    Ok { value: serde_json::Value },

    /// The tool raised; the error is carried in serialized form.
    Error { message: String },
}

impl ToolOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A tool execution result carried by a tool-role message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    /// The tool-call id this result responds to.
    pub call_id: String,

    /// Name of the tool that ran.
    pub name: String,

    /// Success value or serialized error.
    pub output: ToolOutput,
}

/// A single message in the conversation context.
///
/// Only the in-flight assistant message is ever mutated, and only by the
/// stream folder; every other message is immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        id: String,
        parts: Vec<ContentPart>,
        timestamp: DateTime<Utc>,
    },
    Tool {
        id: String,
        results: Vec<ToolResultPart>,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new empty assistant message (parts stream in later).
    pub fn assistant() -> Self {
        Self::Assistant {
            id: Uuid::new_v4().to_string(),
            parts: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant message with the given parts.
    pub fn assistant_with(parts: Vec<ContentPart>) -> Self {
        Self::Assistant {
            id: Uuid::new_v4().to_string(),
            parts,
            timestamp: Utc::now(),
        }
    }

    /// Create a tool message carrying one execution result.
    pub fn tool(result: ToolResultPart) -> Self {
        Self::Tool {
            id: Uuid::new_v4().to_string(),
            results: vec![result],
            timestamp: Utc::now(),
        }
    }

    /// The message id.
    pub fn id(&self) -> &str {
        match self {
            Self::User { id, .. } | Self::Assistant { id, .. } | Self::Tool { id, .. } => id,
        }
    }

    /// The role as a lowercase string, matching the serialized tag.
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    /// Concatenated visible text of this message (empty for tool messages).
    pub fn text(&self) -> String {
        match self {
            Self::User { content, .. } => content.clone(),
            Self::Assistant { parts, .. } => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            Self::Tool { .. } => String::new(),
        }
    }
}

/// The full ordered message history passed to each model invocation.
///
/// Append-only, with one recovery-time exception: a trailing assistant
/// message from a turn that did not finish cleanly may be popped before a
/// replay. Appending never reorders existing entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    messages: Vec<Message>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the end of the history.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Convert a prompt into context entries: a message-array prompt is
    /// spread in order, a string prompt becomes a single user message.
    pub fn append_prompt(&mut self, prompt: &Prompt) {
        match prompt {
            Prompt::Text(text) => self.messages.push(Message::user(text.clone())),
            Prompt::Messages(messages) => self.messages.extend(messages.iter().cloned()),
        }
    }

    /// Pop the trailing message if it is an assistant message.
    ///
    /// The recovery-time exception to append-only. Returns whether a message
    /// was popped.
    pub fn pop_trailing_assistant(&mut self) -> bool {
        if self.messages.last().is_some_and(Message::is_assistant) {
            self.messages.pop();
            true
        } else {
            false
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Mutable access to a message by index, for the stream folder.
    pub fn message_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
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

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
