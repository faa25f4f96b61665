//! Prompt values queued by callers and spliced into the context.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// A pending user input: plain text or an explicit message sequence.
///
/// Exactly one form is present. Enqueueing copies the value, so later
/// caller-side mutation has no effect on a queued prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// Plain text, appended as a single user message.
    Text(String),

    /// An ordered message sequence, spread into the context as-is.
    Messages(Vec<Message>),
}

impl Prompt {
    /// Whether this prompt contributes nothing to the context.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Messages(messages) => messages.is_empty(),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Message>> for Prompt {
    fn from(messages: Vec<Message>) -> Self {
        Self::Messages(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_prompt_from_str() {
        let prompt: Prompt = "Hi".into();
        assert_eq!(prompt, Prompt::Text("Hi".into()));
        assert!(!prompt.is_empty());
    }

    #[test]
    fn empty_forms_are_empty() {
        assert!(Prompt::Text(String::new()).is_empty());
        assert!(Prompt::Messages(Vec::new()).is_empty());
    }

    #[test]
    fn enqueued_copy_is_independent_of_caller_mutation() {
        let mut original = String::from("steady as she goes");
        let queued: Prompt = original.clone().into();
        original.push_str(" -- amended");
        assert_eq!(queued, Prompt::Text("steady as she goes".into()));
    }

    #[test]
    fn untagged_serialization_distinguishes_forms() {
        let text: Prompt = "plain".into();
        assert_eq!(serde_json::to_string(&text).unwrap(), r#""plain""#);

        let messages: Prompt = vec![Message::user("hi")].into();
        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.starts_with('['));

        let back: Prompt = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Prompt::Messages(ref m) if m.len() == 1));
    }
}
