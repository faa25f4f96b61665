//! Agent event bus — instance-scoped fan-out to subscribed listeners.
//!
//! Every state transition and streaming delta is published here in exactly
//! the order it was folded, which is exactly the order the provider emitted
//! it. Delivery is synchronous at publish time; a listener that needs to do
//! real work should hand the event off to its own channel or task. Listeners
//! may reenter the agent (steer, abort, configuration updates) — no agent
//! lock is held while they run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, SessionId, TurnId};
use crate::prompt::Prompt;
use crate::provider::{FinishReason, Usage};

/// What caused a session or turn to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartCause {
    /// Explicit caller start.
    Start,

    /// Caller-initiated recovery of an interrupted session.
    Recover,

    /// Steering input preempted the previous turn.
    Steer,

    /// A queued follow-up began a new turn.
    FollowUp,
}

/// Events published by the agent.
///
/// Message-bearing events carry immutable snapshots of the in-flight
/// assistant message, cloned at publish time — subscribers never hold an
/// aliasing reference into live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A session began.
    SessionStart { session: SessionId, cause: StartCause },

    /// A session ended. Not emitted for aborted sessions.
    SessionEnd { session: SessionId },

    /// A turn began with the given prompt batch.
    TurnStart {
        turn: TurnId,
        cause: StartCause,
        prompts: Vec<Prompt>,
    },

    /// A turn finished streaming.
    TurnFinish {
        turn: TurnId,
        reason: FinishReason,
        usage: Usage,
    },

    /// The provider failed mid-turn.
    TurnError { turn: TurnId, error: ProviderError },

    /// The turn was aborted with a caller-supplied reason.
    TurnAborted { turn: TurnId, reason: String },

    /// Steering preempted the turn; the dequeued prompts start the next one.
    TurnSteered { turn: TurnId, prompts: Vec<Prompt> },

    /// A reasoning part began.
    ReasoningStart { message: Arc<Message> },

    /// The open reasoning part grew.
    ReasoningUpdate { message: Arc<Message> },

    /// The open reasoning part is complete.
    ReasoningEnd { message: Arc<Message> },

    /// A text part began.
    TextStart { message: Arc<Message> },

    /// The open text part grew.
    TextUpdate { message: Arc<Message> },

    /// The open text part is complete.
    TextEnd { message: Arc<Message> },

    /// The model requested a tool invocation.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool finished; its result was appended to the context.
    ToolResult {
        id: String,
        name: String,
        value: serde_json::Value,
    },

    /// A tool raised; the serialized error was appended to the context.
    ToolError {
        id: String,
        name: String,
        error: String,
    },
}

impl AgentEvent {
    /// The event kind as a stable snake_case name, matching the serialized
    /// tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnFinish { .. } => "turn_finish",
            Self::TurnError { .. } => "turn_error",
            Self::TurnAborted { .. } => "turn_aborted",
            Self::TurnSteered { .. } => "turn_steered",
            Self::ReasoningStart { .. } => "reasoning_start",
            Self::ReasoningUpdate { .. } => "reasoning_update",
            Self::ReasoningEnd { .. } => "reasoning_end",
            Self::TextStart { .. } => "text_start",
            Self::TextUpdate { .. } => "text_update",
            Self::TextEnd { .. } => "text_end",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolError { .. } => "tool_error",
        }
    }
}

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Subscription token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A fan-out broadcaster scoped to one agent instance.
///
/// No global registry: the bus lives and dies with its agent. Listeners are
/// invoked synchronously at publish time, outside the bus lock, so a
/// listener may subscribe or unsubscribe reentrantly.
pub struct EventBus {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe a listener; returns a token for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        Subscription(id)
    }

    /// Remove a listener. Returns whether it was still subscribed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.0);
        listeners.len() != before
    }

    /// Deliver an event to every current subscriber.
    pub fn publish(&self, event: &AgentEvent) {
        let snapshot: Vec<Listener> = self.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
