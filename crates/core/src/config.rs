//! Agent configuration and incremental updates.
//!
//! Configuration is set at construction and replaced wholesale through a
//! [`ConfigPatch`]. A patch issued mid-turn is merged into one pending patch
//! and applied atomically at the next safe checkpoint; it never lands
//! field-by-field in the middle of a turn.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::SamplingParams;
use crate::tool::ToolRegistry;

/// How a prompt queue hands entries to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueMode {
    /// Remove and return the single oldest entry.
    Fifo,

    /// Remove and return the entire queue in insertion order.
    DrainAll,
}

/// Configuration for one agent instance.
///
/// Values are copied on input and read, so callers cannot alias internal
/// state after construction.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The model to use (e.g., "anthropic/claude-sonnet-4").
    pub model: String,

    /// Provider-specific options, passed through opaquely.
    pub provider_options: serde_json::Map<String, serde_json::Value>,

    /// System prompt, if any.
    pub system_prompt: Option<String>,

    /// Tools available to the model.
    pub tools: Arc<ToolRegistry>,

    /// Sampling parameters.
    pub sampling: SamplingParams,

    /// Dequeue policy for the steering queue.
    pub steering_mode: DequeueMode,

    /// Dequeue policy for the follow-up queue.
    pub follow_up_mode: DequeueMode,
}

impl AgentConfig {
    /// Create a configuration with defaults: no system prompt, no tools,
    /// steering drains all pending prompts, follow-ups are taken one at a
    /// time.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider_options: serde_json::Map::new(),
            system_prompt: None,
            tools: Arc::new(ToolRegistry::new()),
            sampling: SamplingParams::default(),
            steering_mode: DequeueMode::DrainAll,
            follow_up_mode: DequeueMode::Fifo,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_provider_options(
        mut self,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.provider_options = options;
        self
    }

    pub fn with_steering_mode(mut self, mode: DequeueMode) -> Self {
        self.steering_mode = mode;
        self
    }

    pub fn with_follow_up_mode(mut self, mode: DequeueMode) -> Self {
        self.follow_up_mode = mode;
        self
    }

    /// Apply a patch: every set field replaces the current value, unset
    /// fields are kept. One merge-and-clear step, never partial.
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(options) = patch.provider_options {
            self.provider_options = options;
        }
        if let Some(prompt) = patch.system_prompt {
            self.system_prompt = prompt;
        }
        if let Some(tools) = patch.tools {
            self.tools = tools;
        }
        if let Some(sampling) = patch.sampling {
            self.sampling = sampling;
        }
        if let Some(mode) = patch.steering_mode {
            self.steering_mode = mode;
        }
        if let Some(mode) = patch.follow_up_mode {
            self.follow_up_mode = mode;
        }
    }
}

/// An incremental configuration update. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub model: Option<String>,

    pub provider_options: Option<serde_json::Map<String, serde_json::Value>>,

    /// `Some(None)` clears the system prompt; `None` leaves it untouched.
    pub system_prompt: Option<Option<String>>,

    pub tools: Option<Arc<ToolRegistry>>,

    pub sampling: Option<SamplingParams>,

    pub steering_mode: Option<DequeueMode>,

    pub follow_up_mode: Option<DequeueMode>,
}

impl ConfigPatch {
    /// Merge a later patch into this one: fields set in `later` win, fields
    /// unset in `later` keep this patch's value.
    pub fn merge(&mut self, later: ConfigPatch) {
        if later.model.is_some() {
            self.model = later.model;
        }
        if later.provider_options.is_some() {
            self.provider_options = later.provider_options;
        }
        if later.system_prompt.is_some() {
            self.system_prompt = later.system_prompt;
        }
        if later.tools.is_some() {
            self.tools = later.tools;
        }
        if later.sampling.is_some() {
            self.sampling = later.sampling;
        }
        if later.steering_mode.is_some() {
            self.steering_mode = later.steering_mode;
        }
        if later.follow_up_mode.is_some() {
            self.follow_up_mode = later.follow_up_mode;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.provider_options.is_none()
            && self.system_prompt.is_none()
            && self.tools.is_none()
            && self.sampling.is_none()
            && self.steering_mode.is_none()
            && self.follow_up_mode.is_none()
    }
}
