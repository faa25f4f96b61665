//! The stream event folder.
//!
//! Consumes one provider event sequence per turn and folds it into the
//! conversation context, emitting one bus event per incremental change in
//! exactly the order received. The fold owns the in-flight assistant
//! message: it is appended to the context as soon as the first content part
//! begins streaming (so partial output stays visible if the turn later
//! fails) and mutated in place afterwards, never replaced.

use std::sync::Arc;

use tracing::{debug, warn};

use tiller_core::cancel::{CancelCause, CancelToken};
use tiller_core::config::DequeueMode;
use tiller_core::error::ProtocolError;
use tiller_core::event::{AgentEvent, StartCause};
use tiller_core::message::{ContentPart, Context, Message, PartKind, ToolOutput, ToolResultPart, TurnId};
use tiller_core::prompt::Prompt;
use tiller_core::provider::{FinishReason, StreamEvent, Usage};

use crate::queue::PromptQueue;

/// How a fully consumed event sequence left the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FoldOutcome {
    /// turn-finish arrived; the clean end of a turn.
    Finished(FinishReason),

    /// turn-error arrived; the session ends and awaits recovery.
    Errored,

    /// turn-abort with a user cause arrived; the session unwinds.
    Aborted,

    /// turn-abort with the steering cause arrived; the next prompt batch is
    /// already installed.
    Steered,
}

/// The slice of scheduler state one fold step may touch.
///
/// Borrowed fresh from the shared state for every event, so no lock is held
/// across an await point.
pub(crate) struct FoldState<'a> {
    pub context: &'a mut Context,
    pub steering: &'a mut PromptQueue,
    pub batch: &'a mut Vec<Prompt>,
    pub cause: &'a mut StartCause,
    pub last_finish: &'a mut Option<FinishReason>,
    pub session_usage: &'a mut Usage,
    pub steering_mode: DequeueMode,
    pub cancel: &'a CancelToken,
}

/// Per-turn fold state: `no message -> message building -> message closed`.
pub(crate) struct TurnFold {
    turn: TurnId,
    /// Index of the in-flight assistant message in the context.
    in_flight: Option<usize>,
    open_text: bool,
    open_reasoning: bool,
    outcome: Option<FoldOutcome>,
}

impl TurnFold {
    pub fn new(turn: TurnId) -> Self {
        Self {
            turn,
            in_flight: None,
            open_text: false,
            open_reasoning: false,
            outcome: None,
        }
    }

    /// The terminal outcome, once a terminal event has been folded.
    pub fn outcome(&self) -> Option<FoldOutcome> {
        self.outcome
    }

    /// Fold one provider event. Context and queue mutations land in `state`;
    /// the events to publish are pushed onto `out` in fold order.
    ///
    /// A returned [`ProtocolError`] is fatal to the turn: the event referred
    /// to state that cannot exist, and no bus event is produced for it.
    pub fn fold(
        &mut self,
        state: FoldState<'_>,
        event: StreamEvent,
        out: &mut Vec<AgentEvent>,
    ) -> Result<(), ProtocolError> {
        match event {
            StreamEvent::TurnStart => {
                self.in_flight = None;
                self.open_text = false;
                self.open_reasoning = false;
                out.push(AgentEvent::TurnStart {
                    turn: self.turn.clone(),
                    cause: *state.cause,
                    prompts: std::mem::take(state.batch),
                });
            }

            StreamEvent::ReasoningStart => {
                let idx = self.ensure_in_flight(state.context);
                if let Some(Message::Assistant { parts, .. }) = state.context.message_mut(idx) {
                    parts.push(ContentPart::Reasoning {
                        text: String::new(),
                    });
                }
                self.open_reasoning = true;
                out.push(AgentEvent::ReasoningStart {
                    message: snapshot(state.context, idx),
                });
            }

            StreamEvent::ReasoningDelta { text } => {
                let message = self.append_delta(state.context, PartKind::Reasoning, &text)?;
                out.push(AgentEvent::ReasoningUpdate { message });
            }

            StreamEvent::ReasoningEnd => {
                let Some(idx) = self.in_flight else {
                    return Err(ProtocolError::EndWithoutMessage {
                        kind: PartKind::Reasoning,
                    });
                };
                self.open_reasoning = false;
                out.push(AgentEvent::ReasoningEnd {
                    message: snapshot(state.context, idx),
                });
            }

            StreamEvent::TextStart => {
                let idx = self.ensure_in_flight(state.context);
                if let Some(Message::Assistant { parts, .. }) = state.context.message_mut(idx) {
                    parts.push(ContentPart::Text {
                        text: String::new(),
                    });
                }
                self.open_text = true;
                out.push(AgentEvent::TextStart {
                    message: snapshot(state.context, idx),
                });
            }

            StreamEvent::TextDelta { text } => {
                let message = self.append_delta(state.context, PartKind::Text, &text)?;
                out.push(AgentEvent::TextUpdate { message });
            }

            StreamEvent::TextEnd => {
                let Some(idx) = self.in_flight else {
                    return Err(ProtocolError::EndWithoutMessage {
                        kind: PartKind::Text,
                    });
                };
                self.open_text = false;
                out.push(AgentEvent::TextEnd {
                    message: snapshot(state.context, idx),
                });
            }

            StreamEvent::ToolCall { id, name, input } => {
                let idx = self.ensure_in_flight(state.context);
                if let Some(Message::Assistant { parts, .. }) = state.context.message_mut(idx) {
                    parts.push(ContentPart::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                out.push(AgentEvent::ToolCall { id, name, input });
            }

            StreamEvent::ToolResult { id, name, output } => {
                state.context.push(Message::tool(ToolResultPart {
                    call_id: id.clone(),
                    name: name.clone(),
                    output: ToolOutput::Ok {
                        value: output.clone(),
                    },
                }));
                out.push(AgentEvent::ToolResult {
                    id,
                    name,
                    value: output,
                });
            }

            StreamEvent::ToolError { id, name, error } => {
                state.context.push(Message::tool(ToolResultPart {
                    call_id: id.clone(),
                    name: name.clone(),
                    output: ToolOutput::Error {
                        message: error.clone(),
                    },
                }));
                out.push(AgentEvent::ToolError { id, name, error });
            }

            StreamEvent::StepFinish => {
                if !state.steering.is_empty() {
                    debug!(
                        turn = %self.turn,
                        pending = state.steering.len(),
                        "steering pending at step checkpoint, cancelling turn"
                    );
                    state.cancel.cancel(CancelCause::Steering);
                }
            }

            StreamEvent::TurnFinish { reason, usage } => {
                if self.in_flight.is_none() {
                    // Tolerated: a turn may legally finish without content
                    // (e.g. length-capped before the first token).
                    warn!(
                        turn = %self.turn,
                        ?reason,
                        "turn finished without an in-flight assistant message"
                    );
                }
                *state.last_finish = Some(reason);
                state.session_usage.add(&usage);
                self.outcome = Some(FoldOutcome::Finished(reason));
                out.push(AgentEvent::TurnFinish {
                    turn: self.turn.clone(),
                    reason,
                    usage,
                });
            }

            StreamEvent::TurnError { error } => {
                warn!(turn = %self.turn, error = %error, "turn failed");
                *state.last_finish = Some(FinishReason::Error);
                self.outcome = Some(FoldOutcome::Errored);
                out.push(AgentEvent::TurnError {
                    turn: self.turn.clone(),
                    error,
                });
            }

            StreamEvent::TurnAborted {
                cause: CancelCause::User { reason },
            } => {
                self.outcome = Some(FoldOutcome::Aborted);
                out.push(AgentEvent::TurnAborted {
                    turn: self.turn.clone(),
                    reason,
                });
            }

            StreamEvent::TurnAborted {
                cause: CancelCause::Steering,
            } => {
                if state.steering.is_empty() {
                    return Err(ProtocolError::SteerWithoutPrompts);
                }
                let prompts = state.steering.dequeue(state.steering_mode);
                *state.batch = prompts.clone();
                *state.cause = StartCause::Steer;
                self.outcome = Some(FoldOutcome::Steered);
                out.push(AgentEvent::TurnSteered {
                    turn: self.turn.clone(),
                    prompts,
                });
            }

            StreamEvent::Other { kind, .. } => {
                warn!(turn = %self.turn, kind = %kind, "ignoring unrecognized stream event kind");
            }
        }

        Ok(())
    }

    /// Index of the in-flight assistant message, creating and appending it
    /// to the context if none exists yet.
    fn ensure_in_flight(&mut self, context: &mut Context) -> usize {
        match self.in_flight {
            Some(idx) => idx,
            None => {
                context.push(Message::assistant());
                let idx = context.len() - 1;
                self.in_flight = Some(idx);
                idx
            }
        }
    }

    /// Append delta text to the most recently added open part of `kind`.
    fn append_delta(
        &mut self,
        context: &mut Context,
        kind: PartKind,
        delta: &str,
    ) -> Result<Arc<Message>, ProtocolError> {
        let Some(idx) = self.in_flight else {
            return Err(ProtocolError::DeltaWithoutMessage { kind });
        };
        let open = match kind {
            PartKind::Text => self.open_text,
            PartKind::Reasoning => self.open_reasoning,
        };
        let Some(Message::Assistant { parts, .. }) = context.message_mut(idx) else {
            return Err(ProtocolError::DeltaWithoutMessage { kind });
        };
        let target = if open {
            match kind {
                PartKind::Text => parts.iter_mut().rev().find_map(|part| match part {
                    ContentPart::Text { text } => Some(text),
                    _ => None,
                }),
                PartKind::Reasoning => parts.iter_mut().rev().find_map(|part| match part {
                    ContentPart::Reasoning { text } => Some(text),
                    _ => None,
                }),
            }
        } else {
            None
        };
        let Some(target) = target else {
            return Err(ProtocolError::DeltaWithoutOpenPart { kind });
        };
        target.push_str(delta);
        Ok(snapshot(context, idx))
    }
}

/// An immutable snapshot of the message at `idx`, detached from live state.
fn snapshot(context: &Context, idx: usize) -> Arc<Message> {
    Arc::new(context.messages()[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiller_core::error::ProviderError;

    struct Fixture {
        context: Context,
        steering: PromptQueue,
        batch: Vec<Prompt>,
        cause: StartCause,
        last_finish: Option<FinishReason>,
        session_usage: Usage,
        steering_mode: DequeueMode,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                context: Context::new(),
                steering: PromptQueue::new(),
                batch: Vec::new(),
                cause: StartCause::Start,
                last_finish: None,
                session_usage: Usage::default(),
                steering_mode: DequeueMode::DrainAll,
                cancel: CancelToken::new(),
            }
        }

        fn fold(
            &mut self,
            fold: &mut TurnFold,
            event: StreamEvent,
        ) -> Result<Vec<AgentEvent>, ProtocolError> {
            let mut out = Vec::new();
            fold.fold(
                FoldState {
                    context: &mut self.context,
                    steering: &mut self.steering,
                    batch: &mut self.batch,
                    cause: &mut self.cause,
                    last_finish: &mut self.last_finish,
                    session_usage: &mut self.session_usage,
                    steering_mode: self.steering_mode,
                    cancel: &self.cancel,
                },
                event,
                &mut out,
            )?;
            Ok(out)
        }

        fn fold_all(
            &mut self,
            fold: &mut TurnFold,
            events: Vec<StreamEvent>,
        ) -> Result<Vec<AgentEvent>, ProtocolError> {
            let mut all = Vec::new();
            for event in events {
                all.extend(self.fold(fold, event)?);
            }
            Ok(all)
        }
    }

    #[test]
    fn text_deltas_concatenate_in_order() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold_all(
                &mut fold,
                vec![
                    StreamEvent::TurnStart,
                    StreamEvent::TextStart,
                    StreamEvent::TextDelta { text: "Hel".into() },
                    StreamEvent::TextDelta { text: "lo".into() },
                    StreamEvent::TextEnd,
                    StreamEvent::TurnFinish {
                        reason: FinishReason::Stop,
                        usage: Usage {
                            prompt_tokens: 3,
                            completion_tokens: 2,
                            total_tokens: 5,
                        },
                    },
                ],
            )
            .unwrap();

        assert_eq!(fx.context.len(), 1);
        let message = fx.context.last().unwrap();
        assert!(message.is_assistant());
        assert_eq!(message.text(), "Hello");

        let kinds: Vec<_> = events.iter().map(AgentEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "turn_start",
                "text_start",
                "text_update",
                "text_update",
                "text_end",
                "turn_finish"
            ]
        );
        assert_eq!(fold.outcome(), Some(FoldOutcome::Finished(FinishReason::Stop)));
        assert_eq!(fx.last_finish, Some(FinishReason::Stop));
        assert_eq!(fx.session_usage.total_tokens, 5);
    }

    #[test]
    fn reasoning_and_text_build_separate_parts() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold_all(
            &mut fold,
            vec![
                StreamEvent::TurnStart,
                StreamEvent::ReasoningStart,
                StreamEvent::ReasoningDelta {
                    text: "hmm".into(),
                },
                StreamEvent::ReasoningEnd,
                StreamEvent::TextStart,
                StreamEvent::TextDelta { text: "ok".into() },
                StreamEvent::TextEnd,
            ],
        )
        .unwrap();

        let Some(Message::Assistant { parts, .. }) = fx.context.last() else {
            panic!("expected assistant message");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0],
            ContentPart::Reasoning {
                text: "hmm".into()
            }
        );
        assert_eq!(parts[1], ContentPart::Text { text: "ok".into() });
    }

    #[test]
    fn first_content_part_appends_the_message_immediately() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold(&mut fold, StreamEvent::TurnStart).unwrap();
        assert!(fx.context.is_empty());

        fx.fold(&mut fold, StreamEvent::TextStart).unwrap();
        assert_eq!(fx.context.len(), 1, "partial output must be visible in history");
    }

    #[test]
    fn delta_without_message_is_a_protocol_violation() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let err = fx
            .fold(&mut fold, StreamEvent::TextDelta { text: "x".into() })
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::DeltaWithoutMessage {
                kind: PartKind::Text
            }
        );
    }

    #[test]
    fn delta_after_end_is_a_protocol_violation() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold_all(
            &mut fold,
            vec![StreamEvent::TurnStart, StreamEvent::TextStart, StreamEvent::TextEnd],
        )
        .unwrap();
        let err = fx
            .fold(&mut fold, StreamEvent::TextDelta { text: "x".into() })
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::DeltaWithoutOpenPart {
                kind: PartKind::Text
            }
        );
    }

    #[test]
    fn end_without_message_is_a_protocol_violation() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let err = fx.fold(&mut fold, StreamEvent::ReasoningEnd).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::EndWithoutMessage {
                kind: PartKind::Reasoning
            }
        );
    }

    #[test]
    fn tool_call_creates_the_in_flight_message() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold(
            &mut fold,
            StreamEvent::ToolCall {
                id: "call_1".into(),
                name: "calculator".into(),
                input: json!({"expr": "2+2"}),
            },
        )
        .unwrap();

        let Some(Message::Assistant { parts, .. }) = fx.context.last() else {
            panic!("expected assistant message");
        };
        assert!(matches!(parts[0], ContentPart::ToolCall { .. }));
    }

    #[test]
    fn tool_result_appends_a_tool_message_without_touching_the_assistant() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold_all(
            &mut fold,
            vec![
                StreamEvent::ToolCall {
                    id: "call_1".into(),
                    name: "calculator".into(),
                    input: json!({"expr": "2+2"}),
                },
                StreamEvent::ToolResult {
                    id: "call_1".into(),
                    name: "calculator".into(),
                    output: json!(4),
                },
            ],
        )
        .unwrap();

        assert_eq!(fx.context.len(), 2);
        let Some(Message::Tool { results, .. }) = fx.context.last() else {
            panic!("expected tool message");
        };
        assert_eq!(results[0].call_id, "call_1");
        assert_eq!(results[0].output, ToolOutput::Ok { value: json!(4) });
    }

    #[test]
    fn tool_error_is_tagged_as_error_output() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold(
                &mut fold,
                StreamEvent::ToolError {
                    id: "call_1".into(),
                    name: "shell".into(),
                    error: "exit status 1".into(),
                },
            )
            .unwrap();

        let Some(Message::Tool { results, .. }) = fx.context.last() else {
            panic!("expected tool message");
        };
        assert!(results[0].output.is_error());
        assert_eq!(events[0].kind(), "tool_error");
    }

    #[test]
    fn step_finish_cancels_only_with_pending_steering() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold(&mut fold, StreamEvent::StepFinish).unwrap();
        assert!(!fx.cancel.is_cancelled());

        fx.steering.push("change course".into());
        fx.fold(&mut fold, StreamEvent::StepFinish).unwrap();
        assert!(fx.cancel.is_cancelled());
        assert_eq!(fx.cancel.cause(), Some(CancelCause::Steering));
    }

    #[test]
    fn steering_abort_installs_the_next_batch() {
        let mut fx = Fixture::new();
        fx.steering.push("first".into());
        fx.steering.push("second".into());
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold(
                &mut fold,
                StreamEvent::TurnAborted {
                    cause: CancelCause::Steering,
                },
            )
            .unwrap();

        assert_eq!(fold.outcome(), Some(FoldOutcome::Steered));
        assert_eq!(fx.cause, StartCause::Steer);
        assert_eq!(
            fx.batch,
            vec![Prompt::Text("first".into()), Prompt::Text("second".into())]
        );
        assert!(fx.steering.is_empty());
        assert_eq!(events[0].kind(), "turn_steered");
    }

    #[test]
    fn steering_abort_respects_fifo_mode() {
        let mut fx = Fixture::new();
        fx.steering_mode = DequeueMode::Fifo;
        fx.steering.push("first".into());
        fx.steering.push("second".into());
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold(
            &mut fold,
            StreamEvent::TurnAborted {
                cause: CancelCause::Steering,
            },
        )
        .unwrap();

        assert_eq!(fx.batch, vec![Prompt::Text("first".into())]);
        assert_eq!(fx.steering.len(), 1);
    }

    #[test]
    fn steering_abort_with_empty_queue_is_a_protocol_violation() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let err = fx
            .fold(
                &mut fold,
                StreamEvent::TurnAborted {
                    cause: CancelCause::Steering,
                },
            )
            .unwrap_err();
        assert_eq!(err, ProtocolError::SteerWithoutPrompts);
    }

    #[test]
    fn user_abort_carries_the_reason() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold(
                &mut fold,
                StreamEvent::TurnAborted {
                    cause: CancelCause::user("stop please"),
                },
            )
            .unwrap();

        assert_eq!(fold.outcome(), Some(FoldOutcome::Aborted));
        match &events[0] {
            AgentEvent::TurnAborted { reason, .. } => assert_eq!(reason, "stop please"),
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[test]
    fn turn_start_consumes_the_prompt_batch() {
        let mut fx = Fixture::new();
        fx.batch = vec!["Hi".into()];
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx.fold(&mut fold, StreamEvent::TurnStart).unwrap();

        assert!(fx.batch.is_empty());
        match &events[0] {
            AgentEvent::TurnStart { prompts, cause, .. } => {
                assert_eq!(prompts, &vec![Prompt::Text("Hi".into())]);
                assert_eq!(*cause, StartCause::Start);
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[test]
    fn turn_error_records_error_finish() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold(
                &mut fold,
                StreamEvent::TurnError {
                    error: ProviderError::Network("connection reset".into()),
                },
            )
            .unwrap();

        assert_eq!(fold.outcome(), Some(FoldOutcome::Errored));
        assert_eq!(fx.last_finish, Some(FinishReason::Error));
        assert_eq!(events[0].kind(), "turn_error");
    }

    #[test]
    fn turn_finish_without_content_is_tolerated() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold(
            &mut fold,
            StreamEvent::TurnFinish {
                reason: FinishReason::Length,
                usage: Usage::default(),
            },
        )
        .unwrap();
        assert_eq!(fold.outcome(), Some(FoldOutcome::Finished(FinishReason::Length)));
    }

    #[test]
    fn unrecognized_event_kinds_are_ignored() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        let events = fx
            .fold(
                &mut fold,
                StreamEvent::Other {
                    kind: "headroom_report".into(),
                    payload: json!({"pct": 12}),
                },
            )
            .unwrap();
        assert!(events.is_empty());
        assert!(fold.outcome().is_none());
    }

    #[test]
    fn published_snapshots_are_detached_from_live_state() {
        let mut fx = Fixture::new();
        let mut fold = TurnFold::new(TurnId::new());

        fx.fold_all(&mut fold, vec![StreamEvent::TurnStart, StreamEvent::TextStart])
            .unwrap();
        let events = fx
            .fold(&mut fold, StreamEvent::TextDelta { text: "Hel".into() })
            .unwrap();
        let AgentEvent::TextUpdate { message } = &events[0] else {
            panic!("expected text_update");
        };
        let snapshot = Arc::clone(message);

        fx.fold(&mut fold, StreamEvent::TextDelta { text: "lo".into() })
            .unwrap();

        assert_eq!(snapshot.text(), "Hel");
        assert_eq!(fx.context.last().unwrap().text(), "Hello");
    }
}
