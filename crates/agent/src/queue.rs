//! Pending-prompt queues for steering and follow-up input.

use std::collections::VecDeque;

use tiller_core::config::DequeueMode;
use tiller_core::prompt::Prompt;

/// An ordered queue of pending prompts.
///
/// Callers push; only the scheduler drains. The policy is decided at drain
/// time, so a configuration update can change it between turns.
#[derive(Debug, Clone, Default)]
pub struct PromptQueue {
    items: VecDeque<Prompt>,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a prompt. The value was copied on the way in, so the caller
    /// keeps no handle to it.
    pub fn push(&mut self, prompt: Prompt) {
        self.items.push_back(prompt);
    }

    /// Remove and return pending prompts per the given mode: the single
    /// oldest entry (fifo) or the whole queue in insertion order (drain-all).
    pub fn dequeue(&mut self, mode: DequeueMode) -> Vec<Prompt> {
        match mode {
            DequeueMode::Fifo => self.items.pop_front().into_iter().collect(),
            DequeueMode::DrainAll => self.items.drain(..).collect(),
        }
    }

    /// Remove and return everything, regardless of configured mode.
    /// Recovery replays all pending input.
    pub fn drain_all(&mut self) -> Vec<Prompt> {
        self.dequeue(DequeueMode::DrainAll)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
