//! The run-loop / turn scheduler.
//!
//! [`Agent`] owns the session lifecycle: it clears and fills the prompt
//! queues, appends prompt batches to the context, invokes the streaming
//! provider once per turn, folds the resulting event sequence, and decides
//! what runs next (steering first, then follow-up, then idle).
//!
//! All state lives behind one mutex with short lock scopes — the lock is
//! never held across an await point or while listeners run, so `steer`,
//! `follow_up`, `abort`, and `update_config` are safely callable while a
//! turn is suspended mid-stream, including from event listeners.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tiller_core::cancel::{CancelCause, CancelToken};
use tiller_core::config::{AgentConfig, ConfigPatch};
use tiller_core::error::{Error, ProviderError, Result};
use tiller_core::event::{AgentEvent, EventBus, StartCause, Subscription};
use tiller_core::message::{Context, Message, SessionId, TurnId};
use tiller_core::prompt::Prompt;
use tiller_core::provider::{FinishReason, ProviderRequest, StreamingProvider, Usage};

use crate::folder::{FoldOutcome, FoldState, TurnFold};
use crate::queue::PromptQueue;

/// Mutable agent state, exclusively owned by the instance.
struct Shared {
    context: Context,
    steering: PromptQueue,
    follow_up: PromptQueue,
    config: AgentConfig,
    pending_patch: Option<ConfigPatch>,
    /// The prompt batch the next turn starts from.
    batch: Vec<Prompt>,
    /// Start cause attached to the next turn.
    cause: StartCause,
    /// Start cause of the running session (start or recover).
    session_cause: StartCause,
    /// Set by recover(): run one turn even with an empty batch.
    recovering: bool,
    session: SessionId,
    session_usage: Usage,
    last_finish: Option<FinishReason>,
    /// The live turn's cancellation token; reminted per turn.
    cancel: CancelToken,
    running: bool,
    aborted: bool,
}

/// The turn-taking agent.
///
/// One logical thread of control: no two turns of the same agent run
/// concurrently, and context and queues have no external mutation path.
pub struct Agent {
    id: String,
    provider: Arc<dyn StreamingProvider>,
    bus: Arc<EventBus>,
    shared: Arc<Mutex<Shared>>,
    /// true while a session task is live; abort flips it early.
    idle: Arc<watch::Sender<bool>>,
}

impl Agent {
    pub fn new(provider: Arc<dyn StreamingProvider>, config: AgentConfig) -> Self {
        let (idle_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            provider,
            bus: Arc::new(EventBus::new()),
            shared: Arc::new(Mutex::new(Shared {
                context: Context::new(),
                steering: PromptQueue::new(),
                follow_up: PromptQueue::new(),
                config,
                pending_patch: None,
                batch: Vec::new(),
                cause: StartCause::Start,
                session_cause: StartCause::Start,
                recovering: false,
                session: SessionId::new(),
                session_usage: Usage::default(),
                last_finish: None,
                cancel: CancelToken::new(),
                running: false,
                aborted: false,
            })),
            idle: Arc::new(idle_tx),
        }
    }

    /// Begin a new session with the given prompt.
    ///
    /// Fails (returns false) if a session is already running. Clears both
    /// queues; a fresh start owes nothing to the previous session.
    pub fn start(&self, prompt: impl Into<Prompt>) -> bool {
        let prompt = prompt.into();
        {
            let mut s = self.lock();
            if s.running {
                warn!(agent_id = %self.id, "start called while a session is running");
                return false;
            }
            s.running = true;
            s.aborted = false;
            s.recovering = false;
            s.steering.clear();
            s.follow_up.clear();
            s.batch = vec![prompt];
            s.cause = StartCause::Start;
            s.session_cause = StartCause::Start;
            s.session = SessionId::new();
            s.session_usage = Usage::default();
            self.idle.send_replace(true);
        }
        self.spawn_session();
        true
    }

    /// Queue steering input; takes effect at the current turn's next
    /// step-finish checkpoint. Fails (returns false) when idle.
    pub fn steer(&self, prompt: impl Into<Prompt>) -> bool {
        let mut s = self.lock();
        if !s.running {
            warn!(agent_id = %self.id, "steer called while idle");
            return false;
        }
        s.steering.push(prompt.into());
        true
    }

    /// Queue a follow-up; taken up once the current prompt batch's turns are
    /// exhausted with no pending steering. Fails (returns false) when idle.
    pub fn follow_up(&self, prompt: impl Into<Prompt>) -> bool {
        let mut s = self.lock();
        if !s.running {
            warn!(agent_id = %self.id, "follow_up called while idle");
            return false;
        }
        s.follow_up.push(prompt.into());
        true
    }

    /// Cancel the active turn and terminate the session out-of-band.
    ///
    /// The steering cause is reserved for the scheduler and rejected with
    /// [`Error::ReservedCancelCause`]. Idle waiters resolve immediately; the
    /// turn's abort handling still runs (and may publish a turn-abort event)
    /// as the provider drains, but no session-end is emitted.
    pub fn abort(&self, cause: CancelCause) -> Result<bool> {
        if cause.is_steering() {
            warn!(agent_id = %self.id, "abort called with the reserved steering cause");
            return Err(Error::ReservedCancelCause);
        }
        let mut s = self.lock();
        if !s.running {
            warn!(agent_id = %self.id, "abort called while idle");
            return Ok(false);
        }
        s.aborted = true;
        s.cancel.cancel(cause);
        self.idle.send_replace(false);
        Ok(true)
    }

    /// Resume after an abort or error using existing context and any
    /// still-queued prompts.
    ///
    /// Exactly one branch fires, in order: replay a mid-flight interruption
    /// (last message not from the assistant), retry an unfinished turn
    /// (dropping its trailing assistant message), replay pending steering,
    /// replay pending follow-ups, or fail — there is nothing to recover.
    pub fn recover(&self) -> bool {
        {
            let mut s = self.lock();
            if s.running {
                warn!(agent_id = %self.id, "recover called while a session is running");
                return false;
            }
            if s.context.is_empty() {
                warn!(agent_id = %self.id, "recover called with an empty context");
                return false;
            }

            let last_is_assistant = s.context.last().is_some_and(Message::is_assistant);
            let replay = if !last_is_assistant {
                Vec::new()
            } else if !s.last_finish.is_some_and(|reason| reason.is_clean()) {
                s.context.pop_trailing_assistant();
                Vec::new()
            } else if !s.steering.is_empty() {
                s.steering.drain_all()
            } else if !s.follow_up.is_empty() {
                s.follow_up.drain_all()
            } else {
                warn!(agent_id = %self.id, "nothing to recover");
                return false;
            };

            s.running = true;
            s.aborted = false;
            s.recovering = true;
            s.batch = replay;
            s.cause = StartCause::Recover;
            s.session_cause = StartCause::Recover;
            s.session = SessionId::new();
            s.session_usage = Usage::default();
            self.idle.send_replace(true);
        }
        self.spawn_session();
        true
    }

    /// Clear context, queues, and turn bookkeeping. Fails (returns false)
    /// while a session is running.
    pub fn reset(&self) -> bool {
        let mut s = self.lock();
        if s.running {
            warn!(agent_id = %self.id, "reset called while a session is running");
            return false;
        }
        s.context.clear();
        s.steering.clear();
        s.follow_up.clear();
        s.last_finish = None;
        s.session_usage = Usage::default();
        s.pending_patch = None;
        true
    }

    /// Merge a configuration update.
    ///
    /// Applied immediately when idle; otherwise merged into the pending
    /// patch and applied atomically at the next safe checkpoint (turn or
    /// session boundary) — never field-by-field mid-turn.
    pub fn update_config(&self, patch: ConfigPatch) {
        let mut s = self.lock();
        if s.running {
            match s.pending_patch.as_mut() {
                Some(pending) => pending.merge(patch),
                None => s.pending_patch = Some(patch),
            }
            debug!(agent_id = %self.id, "configuration update deferred to the next safe checkpoint");
        } else {
            s.config.apply(patch);
            debug!(agent_id = %self.id, "configuration update applied");
        }
    }

    /// Subscribe to the agent's events. Listeners run synchronously at
    /// publish time with no agent lock held, so they may reenter.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.bus.unsubscribe(subscription)
    }

    /// Resolves once the current session has ended or been aborted.
    /// Resolves immediately when idle.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// A copy of the current conversation history.
    pub fn context_snapshot(&self) -> Vec<Message> {
        self.lock().context.messages().to_vec()
    }

    pub fn pending_steering(&self) -> usize {
        self.lock().steering.len()
    }

    pub fn pending_follow_ups(&self) -> usize {
        self.lock().follow_up.len()
    }

    /// A copy of the active configuration (pending patches excluded).
    pub fn config_snapshot(&self) -> AgentConfig {
        self.lock().config.clone()
    }

    /// Accumulated token usage of the current or most recent session.
    pub fn session_usage(&self) -> Usage {
        self.lock().session_usage
    }

    pub fn last_finish_reason(&self) -> Option<FinishReason> {
        self.lock().last_finish
    }

    fn spawn_session(&self) {
        tokio::spawn(run_session(
            self.id.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.bus),
            Arc::clone(&self.shared),
            Arc::clone(&self.idle),
        ));
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One session: loop over prompt batches until none remain, folding one
/// provider stream per batch.
async fn run_session(
    agent_id: String,
    provider: Arc<dyn StreamingProvider>,
    bus: Arc<EventBus>,
    shared: Arc<Mutex<Shared>>,
    idle: Arc<watch::Sender<bool>>,
) {
    let (session, session_cause) = {
        let s = lock(&shared);
        (s.session.clone(), s.session_cause)
    };
    bus.publish(&AgentEvent::SessionStart {
        session: session.clone(),
        cause: session_cause,
    });
    info!(agent_id = %agent_id, session_id = %session, cause = ?session_cause, "session started");

    loop {
        // Safe checkpoint: turn boundary.
        let turn = TurnId::new();
        let request = {
            let mut guard = lock(&shared);
            let s = &mut *guard;
            if let Some(patch) = s.pending_patch.take() {
                s.config.apply(patch);
                debug!(agent_id = %agent_id, "applied deferred configuration update");
            }
            if !s.recovering && s.batch.is_empty() {
                break;
            }
            s.recovering = false;
            for prompt in &s.batch {
                s.context.append_prompt(prompt);
            }
            if s.context.is_empty() {
                warn!(agent_id = %agent_id, "nothing to run: context is empty");
                s.batch.clear();
                break;
            }
            s.cancel = CancelToken::new();
            ProviderRequest {
                model: s.config.model.clone(),
                provider_options: s.config.provider_options.clone(),
                system_prompt: s.config.system_prompt.clone(),
                messages: s.context.messages().to_vec(),
                tools: Arc::clone(&s.config.tools),
                sampling: s.config.sampling,
                cancel: s.cancel.clone(),
            }
        };

        let mut rx = match provider.stream(request).await {
            Ok(rx) => rx,
            Err(error) => {
                error!(
                    agent_id = %agent_id,
                    turn_id = %turn,
                    error = %error,
                    "provider rejected the turn request"
                );
                lock(&shared).last_finish = Some(FinishReason::Error);
                bus.publish(&AgentEvent::TurnError { turn, error });
                break;
            }
        };

        let mut fold = TurnFold::new(turn.clone());
        let mut turn_failed = false;

        loop {
            let Some(event) = rx.recv().await else {
                if fold.outcome().is_none() {
                    warn!(
                        agent_id = %agent_id,
                        turn_id = %turn,
                        "provider stream ended without a terminal event"
                    );
                    lock(&shared).last_finish = Some(FinishReason::Error);
                    bus.publish(&AgentEvent::TurnError {
                        turn: turn.clone(),
                        error: ProviderError::StreamInterrupted(
                            "event stream ended without a terminal event".into(),
                        ),
                    });
                    turn_failed = true;
                }
                break;
            };

            let mut out = Vec::new();
            let folded = {
                let mut guard = lock(&shared);
                let s = &mut *guard;
                fold.fold(
                    FoldState {
                        context: &mut s.context,
                        steering: &mut s.steering,
                        batch: &mut s.batch,
                        cause: &mut s.cause,
                        last_finish: &mut s.last_finish,
                        session_usage: &mut s.session_usage,
                        steering_mode: s.config.steering_mode,
                        cancel: &s.cancel,
                    },
                    event,
                    &mut out,
                )
            };

            match folded {
                Ok(()) => {
                    for event in &out {
                        bus.publish(event);
                    }
                    if fold.outcome().is_some() {
                        break;
                    }
                }
                Err(violation) => {
                    // Fatal for this turn; no bus event is produced for the
                    // inconsistency itself.
                    error!(
                        agent_id = %agent_id,
                        turn_id = %turn,
                        error = %violation,
                        "protocol violation from streaming provider"
                    );
                    {
                        let mut s = lock(&shared);
                        s.last_finish = Some(FinishReason::Error);
                        s.cancel.cancel(CancelCause::user("protocol violation"));
                    }
                    turn_failed = true;
                    break;
                }
            }
        }
        drop(rx);

        // Decide what runs next: steering first, then follow-up, then idle.
        {
            let mut guard = lock(&shared);
            let s = &mut *guard;
            if s.aborted || turn_failed {
                break;
            }
            match fold.outcome() {
                Some(FoldOutcome::Steered) => {
                    // The fold already installed the steering batch.
                }
                Some(FoldOutcome::Aborted) => {
                    s.aborted = true;
                    break;
                }
                Some(FoldOutcome::Errored) => break,
                Some(FoldOutcome::Finished(_)) | None => {
                    if !s.steering.is_empty() {
                        s.batch = s.steering.dequeue(s.config.steering_mode);
                        s.cause = StartCause::Steer;
                    } else {
                        s.batch = s.follow_up.dequeue(s.config.follow_up_mode);
                        s.cause = StartCause::FollowUp;
                    }
                    if s.batch.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    let aborted = {
        let mut s = lock(&shared);
        if let Some(patch) = s.pending_patch.take() {
            s.config.apply(patch);
        }
        s.batch.clear();
        s.recovering = false;
        s.aborted
    };

    if aborted {
        info!(agent_id = %agent_id, session_id = %session, "session aborted");
    } else {
        bus.publish(&AgentEvent::SessionEnd {
            session: session.clone(),
        });
        info!(agent_id = %agent_id, session_id = %session, "session ended");
    }

    let mut s = lock(&shared);
    s.running = false;
    idle.send_replace(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tiller_core::message::ContentPart;
    use tiller_core::provider::StreamEvent;
    use tokio::sync::mpsc;

    /// Replies to every turn with a fixed one-part text message and records
    /// each request.
    struct StubProvider {
        reply: String,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl StubProvider {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.into(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ProviderRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamingProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn stream(
            &self,
            request: ProviderRequest,
        ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            let (tx, rx) = mpsc::channel(16);
            let reply = self.reply.clone();
            tokio::spawn(async move {
                let events = vec![
                    StreamEvent::TurnStart,
                    StreamEvent::TextStart,
                    StreamEvent::TextDelta { text: reply },
                    StreamEvent::TextEnd,
                    StreamEvent::TurnFinish {
                        reason: FinishReason::Stop,
                        usage: Usage {
                            prompt_tokens: 10,
                            completion_tokens: 5,
                            total_tokens: 15,
                        },
                    },
                ];
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn agent_with(provider: Arc<StubProvider>) -> Agent {
        Agent::new(provider, AgentConfig::new("test-model"))
    }

    #[tokio::test]
    async fn start_runs_one_turn_and_goes_idle() {
        let provider = StubProvider::new("Hello back");
        let agent = agent_with(Arc::clone(&provider));

        assert!(agent.start("Hi"));
        agent.wait_for_idle().await;

        assert!(!agent.is_running());
        let context = agent.context_snapshot();
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role(), "user");
        assert_eq!(context[1].text(), "Hello back");
        assert_eq!(agent.session_usage().total_tokens, 15);
        assert_eq!(agent.last_finish_reason(), Some(FinishReason::Stop));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn start_while_running_returns_false_without_mutation() {
        let provider = StubProvider::new("reply");
        let agent = Arc::new(agent_with(provider));

        let results = Arc::new(Mutex::new(Vec::new()));
        let agent2 = Arc::clone(&agent);
        let results2 = Arc::clone(&results);
        agent.subscribe(move |event| {
            if event.kind() == "text_start" {
                results2.lock().unwrap().push(agent2.start("intruder"));
            }
        });

        assert!(agent.start("Hi"));
        agent.wait_for_idle().await;

        assert_eq!(results.lock().unwrap().as_slice(), &[false]);
        // The rejected start left no trace: one user message, one reply.
        let context = agent.context_snapshot();
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].text(), "Hi");
    }

    #[tokio::test]
    async fn steer_and_follow_up_fail_when_idle() {
        let agent = agent_with(StubProvider::new("reply"));

        assert!(!agent.steer("too early"));
        assert!(!agent.follow_up("too early"));
        assert_eq!(agent.pending_steering(), 0);
        assert_eq!(agent.pending_follow_ups(), 0);
    }

    #[tokio::test]
    async fn abort_rejects_the_reserved_steering_cause() {
        let agent = agent_with(StubProvider::new("reply"));

        let err = agent.abort(CancelCause::Steering).unwrap_err();
        assert!(matches!(err, Error::ReservedCancelCause));
    }

    #[tokio::test]
    async fn abort_while_idle_returns_false() {
        let agent = agent_with(StubProvider::new("reply"));
        assert_eq!(agent.abort(CancelCause::user("stop")).unwrap(), false);
    }

    #[tokio::test]
    async fn reset_clears_state_only_when_idle() {
        let agent = agent_with(StubProvider::new("reply"));

        agent.start("Hi");
        agent.wait_for_idle().await;
        assert!(!agent.context_snapshot().is_empty());

        assert!(agent.reset());
        assert!(agent.context_snapshot().is_empty());
        assert_eq!(agent.last_finish_reason(), None);
    }

    #[tokio::test]
    async fn wait_for_idle_resolves_immediately_when_never_started() {
        let agent = agent_with(StubProvider::new("reply"));
        agent.wait_for_idle().await;
    }

    #[tokio::test]
    async fn recover_fails_on_empty_context_or_nothing_pending() {
        let agent = agent_with(StubProvider::new("reply"));
        assert!(!agent.recover(), "empty context");

        agent.start("Hi");
        agent.wait_for_idle().await;
        // Clean finish, empty queues: nothing to recover.
        assert!(!agent.recover());
    }

    #[tokio::test]
    async fn recover_pops_the_unclean_trailing_assistant_and_retries() {
        let provider = StubProvider::new("recovered reply");
        let agent = agent_with(Arc::clone(&provider));

        {
            let mut s = agent.lock();
            s.context.push(Message::user("question"));
            s.context.push(Message::assistant_with(vec![ContentPart::Text {
                text: "partial".into(),
            }]));
            s.last_finish = Some(FinishReason::Length);
        }

        assert!(agent.recover());
        agent.wait_for_idle().await;

        let context = agent.context_snapshot();
        assert_eq!(context.len(), 2, "one assistant message in place, not two");
        assert_eq!(context[1].text(), "recovered reply");

        // The replay request did not carry the popped partial message.
        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn recover_replays_with_empty_input_when_last_is_not_assistant() {
        let provider = StubProvider::new("answer");
        let agent = agent_with(Arc::clone(&provider));

        {
            let mut s = agent.lock();
            s.context.push(Message::user("question"));
        }

        assert!(agent.recover());
        agent.wait_for_idle().await;

        let context = agent.context_snapshot();
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].text(), "answer");
    }

    #[tokio::test]
    async fn recover_replays_pending_steering_before_follow_ups() {
        let provider = StubProvider::new("reply");
        let agent = agent_with(Arc::clone(&provider));

        {
            let mut s = agent.lock();
            s.context.push(Message::user("question"));
            s.context.push(Message::assistant_with(vec![ContentPart::Text {
                text: "done".into(),
            }]));
            s.last_finish = Some(FinishReason::Stop);
            s.steering.push("correction".into());
            s.follow_up.push("later".into());
        }

        assert!(agent.recover());
        agent.wait_for_idle().await;

        // The steering prompt replayed first; the still-queued follow-up ran
        // as its own turn afterwards.
        let context = agent.context_snapshot();
        let texts: Vec<String> = context.iter().map(Message::text).collect();
        assert_eq!(
            texts,
            vec!["question", "done", "correction", "reply", "later", "reply"]
        );
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn update_config_applies_immediately_when_idle() {
        let agent = agent_with(StubProvider::new("reply"));

        agent.update_config(ConfigPatch {
            model: Some("other-model".into()),
            ..Default::default()
        });
        assert_eq!(agent.config_snapshot().model, "other-model");
    }
}
