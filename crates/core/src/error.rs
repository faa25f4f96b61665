//! Error types for the tiller domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; `Error` is the top-level
//! umbrella the run-loop propagates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::PartKind;

/// The top-level error type for all tiller operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Stream protocol violations ---
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Misuse ---
    #[error("the steering cancellation cause is reserved for internal use")]
    ReservedCancelCause,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures reported by the streaming provider collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures raised by tool implementations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} - {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// An incremental event referenced state that cannot exist.
///
/// These are invariant checks against a misbehaving streaming collaborator,
/// not normal runtime errors. A protocol violation is fatal to the turn being
/// folded; it is logged and propagated, never surfaced as a bus event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{kind} delta arrived with no assistant message in flight")]
    DeltaWithoutMessage { kind: PartKind },

    #[error("{kind} delta arrived with no open {kind} part")]
    DeltaWithoutOpenPart { kind: PartKind },

    #[error("{kind} end arrived with no assistant message in flight")]
    EndWithoutMessage { kind: PartKind },

    #[error("steering abort arrived with an empty steering queue")]
    SteerWithoutPrompts,
}
