//! Turn-scoped cancellation with a typed cause.
//!
//! One token is live per turn; a fresh one is minted before each provider
//! call. The cause is a tagged variant rather than a reserved string, so a
//! caller-supplied abort reason can never collide with the internal steering
//! cancel.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why a turn's token was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelCause {
    /// Internal cancel issued at a step-finish checkpoint to splice in
    /// steering input. Rejected by the public abort operation.
    Steering,

    /// Externally supplied abort with a caller-provided reason.
    User { reason: String },
}

impl CancelCause {
    pub fn user(reason: impl Into<String>) -> Self {
        Self::User {
            reason: reason.into(),
        }
    }

    pub fn is_steering(&self) -> bool {
        matches!(self, Self::Steering)
    }
}

/// A cancellation token carrying the cause of the first cancel.
///
/// Providers observe cancellation through [`cancelled`](Self::cancelled) or
/// [`is_cancelled`](Self::is_cancelled) and terminate their event sequence
/// with a turn-abort event echoing [`cause`](Self::cause).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with the given cause. The first cause wins; later calls keep
    /// the original.
    pub fn cancel(&self, cause: CancelCause) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The cause of the first cancel, if any.
    pub fn cause(&self) -> Option<CancelCause> {
        self.cause.get().cloned()
    }
}
