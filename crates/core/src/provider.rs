//! The streaming-provider seam — the abstraction over LLM backends.
//!
//! A provider turns one request into a single-pass, in-order sequence of
//! incremental [`StreamEvent`]s terminated by exactly one of turn-finish,
//! turn-error, or turn-abort. Tool execution happens inside the provider
//! boundary and surfaces as tool-result / tool-error events within the same
//! sequence; the request carries the shared tool registry for that purpose.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cancel::{CancelCause, CancelToken};
use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::ToolRegistry;

/// Token usage statistics for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate another turn's usage onto this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why a turn stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
    Other,
}

impl FinishReason {
    /// Whether this reason marks a cleanly finished turn. Anything else is
    /// treated as incomplete by recovery.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stop | Self::ToolCalls)
    }
}

/// Sampling parameters forwarded verbatim to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

/// One incremental event in a provider's turn stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The turn has begun; no content yet.
    TurnStart,

    /// A reasoning part begins.
    ReasoningStart,

    /// Incremental reasoning text for the open reasoning part.
    ReasoningDelta { text: String },

    /// The open reasoning part is complete.
    ReasoningEnd,

    /// A text part begins.
    TextStart,

    /// Incremental output text for the open text part.
    TextDelta { text: String },

    /// The open text part is complete.
    TextEnd,

    /// The model requested a tool invocation.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool executed successfully.
    ToolResult {
        id: String,
        name: String,
        output: serde_json::Value,
    },

    /// A tool raised; the error is carried in serialized form.
    ToolError {
        id: String,
        name: String,
        error: String,
    },

    /// Checkpoint between steps of a multi-step turn (model call, tool
    /// execution, next model call). The only point where steering may
    /// preempt the turn.
    StepFinish,

    /// Terminal: the turn finished.
    TurnFinish {
        reason: FinishReason,
        #[serde(default)]
        usage: Usage,
    },

    /// Terminal: the provider failed mid-turn.
    TurnError { error: ProviderError },

    /// Terminal: the turn's cancellation token fired.
    TurnAborted { cause: CancelCause },

    /// Forward-compatibility: an event kind this version does not handle.
    Other {
        kind: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl StreamEvent {
    /// Whether this event terminates the sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnFinish { .. } | Self::TurnError { .. } | Self::TurnAborted { .. }
        )
    }
}

/// Everything a provider needs for one turn.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4").
    pub model: String,

    /// Provider-specific options, passed through opaquely.
    pub provider_options: serde_json::Map<String, serde_json::Value>,

    /// System prompt, if any.
    pub system_prompt: Option<String>,

    /// The full conversation context.
    pub messages: Vec<Message>,

    /// Tools the model may call; the provider executes them and surfaces the
    /// results as stream events.
    pub tools: Arc<ToolRegistry>,

    /// Sampling parameters.
    pub sampling: SamplingParams,

    /// The turn's cancellation token.
    pub cancel: CancelToken,
}

/// The streaming-provider trait.
///
/// One call, one turn, one event sequence. Events arrive in order, are
/// consumed in a single pass, and end with exactly one terminal event. A
/// channel that closes without a terminal event is a provider defect the
/// scheduler tolerates as a stream interruption.
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Start one turn and return the receiving end of its event sequence.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError>;
}
