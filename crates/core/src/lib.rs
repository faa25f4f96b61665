//! # Tiller Core
//!
//! Domain types, collaborator traits, and error definitions for the tiller
//! agent run-loop. This crate defines the vocabulary the scheduler folds
//! over — messages, prompts, stream events, cancellation, configuration —
//! plus the seams to the three external collaborators: the streaming
//! provider, tool implementations, and the `tracing` logger.
//!
//! ## Design Philosophy
//!
//! All run-loop logic lives in `tiller-agent`; this crate holds the value
//! objects and traits both sides agree on. Collaborators are traits so tests
//! drive the loop with scripted stand-ins.

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod prompt;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use cancel::{CancelCause, CancelToken};
pub use config::{AgentConfig, ConfigPatch, DequeueMode};
pub use error::{Error, ProtocolError, ProviderError, Result, ToolError};
pub use event::{AgentEvent, EventBus, StartCause, Subscription};
pub use message::{
    ContentPart, Context, Message, PartKind, SessionId, ToolOutput, ToolResultPart, TurnId,
};
pub use prompt::Prompt;
pub use provider::{
    FinishReason, ProviderRequest, SamplingParams, StreamEvent, StreamingProvider, Usage,
};
pub use tool::{Tool, ToolDefinition, ToolRegistry};
