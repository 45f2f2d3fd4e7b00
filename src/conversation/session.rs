//! A single conversation session.
//!
//! The session owns the state machine, the conversation context, the adapters
//! and the one in-flight turn. Every trigger is evaluated by a serialized
//! dispatcher (an async mutex around [`SessionCore`]): a fire runs to
//! completion, and triggers raised by actions are queued depth-first inside
//! the same dispatch, so transitions never interleave.
//!
//! Two ingestion loops feed the dispatcher: one drains speech-recognition
//! events, the other drains generator / synthesizer / playback events.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::{join_all, try_join_all};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{ChatEngine, InputAdapter, OutputAdapter, SessionComponents, TtsEngine};
use crate::config::{BargeInStrategy, ConversationConfig, TimeoutConfig};
use crate::conversation::context::{ConversationContext, InteractionTurn};
use crate::conversation::state_machine::{
    ConversationState, Decision, InternalAction, Trigger, decide,
};
use crate::conversation::types::{CompletionReason, ParticipantInfo, SessionId, TurnId};
use crate::error::{Result, SessionError};
use crate::metrics::{MetricsCollector, Stage};
use crate::pipeline::latency::LatencyTracker;
use crate::pipeline::messages::{InputEvent, InputSink, OutputEvent, OutputEventKind, OutputSink};
use crate::pipeline::turn::ActiveTurn;
use crate::runtime::{RuntimeEvent, TransitionRecord};

/// Longest chain of follow-up triggers a single fire may cause.
const MAX_CASCADE_STEPS: usize = 64;

const RUNTIME_EVENT_CAPACITY: usize = 256;

/// Data carried alongside a trigger.
#[derive(Debug, Clone)]
enum Payload {
    None,
    Input(InputEvent),
    Output(OutputEvent),
    Failure(String),
}

impl Payload {
    fn error_message(&self) -> Option<&str> {
        match self {
            Self::Failure(message) => Some(message),
            Self::Output(OutputEvent {
                kind: OutputEventKind::Error { message },
                ..
            }) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Fired {
    trigger: Trigger,
    payload: Payload,
}

impl Fired {
    fn plain(trigger: Trigger) -> Self {
        Self {
            trigger,
            payload: Payload::None,
        }
    }

    fn failure(err: &SessionError) -> Self {
        Self {
            trigger: Trigger::ErrorOccurred,
            payload: Payload::Failure(err.to_string()),
        }
    }
}

/// What happened to a fired trigger.
///
/// Describes the first step of the dispatch; follow-up triggers raised by
/// actions are reported through logs and [`RuntimeEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Transitioned {
        from: ConversationState,
        to: ConversationState,
    },
    Internal(InternalAction),
    Ignored,
    /// Barge-in arrived but the strategy kept the current turn.
    GuardRejected,
    /// No rule; converted to an error unless the session is already terminal.
    Unhandled,
    /// The dispatcher gave up and cancelled the session.
    Fatal,
}

struct Inbox {
    input_rx: mpsc::UnboundedReceiver<InputEvent>,
    output_rx: mpsc::UnboundedReceiver<OutputEvent>,
}

/// State mutated only by the dispatcher.
struct SessionCore {
    id: SessionId,
    state: ConversationState,
    barge_in: BargeInStrategy,
    cancel: CancellationToken,
    context: ConversationContext,
    assistant: ParticipantInfo,
    inputs: Vec<Arc<dyn InputAdapter>>,
    output: Option<Arc<dyn OutputAdapter>>,
    chat: Arc<dyn ChatEngine>,
    tts: Arc<dyn TtsEngine>,
    output_audio: bool,
    input_sink: Option<InputSink>,
    output_sink: Option<OutputSink>,
    turn: Option<ActiveTurn>,
    latency: LatencyTracker,
    metrics: Arc<dyn MetricsCollector>,
    timeouts: TimeoutConfig,
    state_tx: watch::Sender<ConversationState>,
    events_tx: broadcast::Sender<RuntimeEvent>,
    torn_down: bool,
}

/// One conversation between human participants and the assistant.
pub struct ConversationSession {
    id: SessionId,
    cancel: CancellationToken,
    core: Mutex<SessionCore>,
    inbox: std::sync::Mutex<Option<Inbox>>,
    state_rx: watch::Receiver<ConversationState>,
    events_tx: broadcast::Sender<RuntimeEvent>,
    running: AtomicBool,
    disposed: AtomicBool,
    done_tx: watch::Sender<bool>,
    shutdown_timeout: Duration,
}

impl ConversationSession {
    /// Create a session in `Initial`.
    ///
    /// `cancel` becomes the session token; pass a child of an orchestrator
    /// token to have the session stop with it.
    pub fn new(
        id: SessionId,
        mut context: ConversationContext,
        components: SessionComponents,
        config: &ConversationConfig,
        metrics: Arc<dyn MetricsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Initial);
        let (events_tx, _) = broadcast::channel(RUNTIME_EVENT_CAPACITY);
        let (done_tx, _) = watch::channel(false);

        let assistant =
            ParticipantInfo::assistant(config.assistant.id.clone(), config.assistant.name.clone());
        context.register_participant(assistant.clone());

        let core = SessionCore {
            id,
            state: ConversationState::Initial,
            barge_in: config.conversation.barge_in,
            cancel: cancel.clone(),
            context,
            assistant,
            inputs: components.inputs,
            output: Some(components.output),
            chat: components.chat,
            tts: components.tts,
            output_audio: false,
            input_sink: Some(InputSink::new(id, input_tx)),
            output_sink: Some(OutputSink::new(id, output_tx)),
            turn: None,
            latency: LatencyTracker::new(id, Arc::clone(&metrics)),
            metrics,
            timeouts: config.timeouts.clone(),
            state_tx,
            events_tx: events_tx.clone(),
            torn_down: false,
        };

        Self {
            id,
            cancel,
            core: Mutex::new(core),
            inbox: std::sync::Mutex::new(Some(Inbox {
                input_rx,
                output_rx,
            })),
            state_rx,
            events_tx,
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            done_tx,
            shutdown_timeout: config.timeouts.session_shutdown(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session cancellation token; every turn token is a child of it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> ConversationState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run the session until it ends.
    ///
    /// Fires `InitializeRequested`, then drives both ingestion loops until the
    /// session token is cancelled, and finally makes sure the session reached
    /// `Ended`.
    ///
    /// # Errors
    ///
    /// Fails only if the session was disposed or is already running.
    pub async fn run(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyRunning);
        }
        let inbox = self
            .inbox
            .lock()
            .ok()
            .and_then(|mut inbox| inbox.take())
            .ok_or(SessionError::AlreadyRunning)?;

        info!("session {} starting", self.id);
        self.fire(Fired::plain(Trigger::InitializeRequested)).await;

        tokio::join!(
            self.input_loop(inbox.input_rx),
            self.output_loop(inbox.output_rx)
        );

        self.finish().await;
        self.done_tx.send_replace(true);
        info!("session {} finished", self.id);
        Ok(())
    }

    /// Request the session to stop. Does not wait.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("session {} stop requested", self.id);
        }
        self.cancel.cancel();
    }

    /// Stop listening to input adapters until [`resume`](Self::resume).
    ///
    /// Only `Idle` and `Listening` accept a pause. Anywhere else the trigger
    /// is unhandled and ends the session with an error; check
    /// [`ConversationState::accepts`] first when the state is not known.
    pub async fn pause(&self) -> FireOutcome {
        self.fire(Fired::plain(Trigger::PauseRequested)).await
    }

    /// Leave `Paused`. Like [`pause`](Self::pause), fatal in any other state.
    pub async fn resume(&self) -> FireOutcome {
        self.fire(Fired::plain(Trigger::ResumeRequested)).await
    }

    /// Wait until `run` has returned.
    pub async fn wait_finished(&self) {
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Stop the session and release its adapters. Runs at most once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        if self.is_running() {
            let mut done = self.done_tx.subscribe();
            let finished = tokio::time::timeout(self.shutdown_timeout, done.wait_for(|d| *d))
                .await
                .is_ok();
            if !finished {
                warn!(
                    "session {} did not finish within {:?}",
                    self.id, self.shutdown_timeout
                );
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, self.core.lock()).await {
            Ok(mut core) => {
                if core.state != ConversationState::Ended {
                    core.dispatch(Fired::plain(Trigger::StopRequested)).await;
                }
                core.teardown().await;
            }
            Err(_) => warn!("session {} is still busy, skipping teardown", self.id),
        }
        info!("session {} disposed", self.id);
    }

    /// Committed transcript, oldest turn first.
    pub async fn history(&self) -> Vec<InteractionTurn> {
        self.core.lock().await.context.history().cloned().collect()
    }

    /// Uncommitted text of `participant_id` in the pending turn.
    pub async fn pending_text(&self, participant_id: &str) -> Option<String> {
        self.core
            .lock()
            .await
            .context
            .pending_text(participant_id)
            .map(str::to_owned)
    }

    /// ID and cancellation token of the in-flight turn.
    pub async fn active_turn(&self) -> Option<(TurnId, CancellationToken)> {
        self.core
            .lock()
            .await
            .turn
            .as_ref()
            .map(|turn| (turn.id(), turn.token().clone()))
    }

    async fn fire(&self, fired: Fired) -> FireOutcome {
        self.core.lock().await.dispatch(fired).await
    }

    async fn input_loop(&self, mut rx: mpsc::UnboundedReceiver<InputEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let mut core = self.core.lock().await;
            core.latency.observe_input(&event);
            let fired = Fired {
                trigger: event.trigger(),
                payload: Payload::Input(event),
            };
            core.dispatch(fired).await;
        }
        debug!("session {} input loop stopped", self.id);
    }

    async fn output_loop(&self, mut rx: mpsc::UnboundedReceiver<OutputEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let mut core = self.core.lock().await;
            if let Some(turn_id) = event.turn_id {
                if core.turn_id() != Some(turn_id) {
                    debug!(
                        "session {}: dropping {:?} from stale turn {turn_id}",
                        self.id,
                        event.trigger()
                    );
                    continue;
                }
            }
            core.latency.observe_output(&event);
            let fired = Fired {
                trigger: event.trigger(),
                payload: Payload::Output(event),
            };
            core.dispatch(fired).await;
        }
        debug!("session {} output loop stopped", self.id);
    }

    async fn finish(&self) {
        let mut core = self.core.lock().await;
        if core.state != ConversationState::Ended {
            core.dispatch(Fired::plain(Trigger::StopRequested)).await;
        }
        core.teardown().await;
    }
}

impl SessionCore {
    fn turn_id(&self) -> Option<TurnId> {
        self.turn.as_ref().map(ActiveTurn::id)
    }

    async fn dispatch(&mut self, first: Fired) -> FireOutcome {
        let mut queue = VecDeque::from([first]);
        let mut outcome = None;
        let mut steps = 0;
        while let Some(fired) = queue.pop_front() {
            steps += 1;
            if steps > MAX_CASCADE_STEPS {
                error!(
                    "session {}: more than {MAX_CASCADE_STEPS} chained triggers in {:?}, cancelling session",
                    self.id, self.state
                );
                self.cancel.cancel();
                return FireOutcome::Fatal;
            }
            let (step, follow_ups) = self.step(fired).await;
            if step == FireOutcome::Fatal {
                return step;
            }
            for follow_up in follow_ups.into_iter().rev() {
                queue.push_front(follow_up);
            }
            outcome.get_or_insert(step);
        }
        outcome.unwrap_or(FireOutcome::Ignored)
    }

    async fn step(&mut self, fired: Fired) -> (FireOutcome, Vec<Fired>) {
        let from = self.state;
        let trigger = fired.trigger;
        let mut follow = Vec::new();

        let outcome = match decide(from, trigger, self.barge_in) {
            Decision::Transition(to) => {
                self.exit_state(from, to, &mut follow).await;
                self.state = to;
                self.state_tx.send_replace(to);
                info!("session {}: {from:?} -> {to:?} on {trigger:?}", self.id);
                let _ = self.events_tx.send(RuntimeEvent::Transition(TransitionRecord {
                    session_id: self.id,
                    from,
                    to,
                    trigger,
                    turn_id: self.turn_id(),
                    at: Utc::now(),
                }));
                self.enter_state(from, to, fired, &mut follow).await;
                FireOutcome::Transitioned { from, to }
            }
            Decision::Internal(action) => {
                debug!("session {}: {action:?} in {from:?}", self.id);
                if let Err(e) = self.run_internal(action, fired.payload).await {
                    warn!("session {}: {action:?} failed: {e}", self.id);
                    follow.push(Fired::failure(&e));
                }
                FireOutcome::Internal(action)
            }
            Decision::Ignore => {
                debug!("session {}: ignored {trigger:?} in {from:?}", self.id);
                FireOutcome::Ignored
            }
            Decision::GuardRejected => {
                info!(
                    "session {}: barge-in {trigger:?} ignored while {from:?}",
                    self.id
                );
                let _ = self.events_tx.send(RuntimeEvent::BargeInIgnored {
                    session_id: self.id,
                    state: from,
                    trigger,
                });
                FireOutcome::GuardRejected
            }
            Decision::Unhandled if from.is_terminal() => {
                debug!("session {}: dropped {trigger:?} in {from:?}", self.id);
                FireOutcome::Unhandled
            }
            Decision::Unhandled if trigger == Trigger::ErrorOccurred => {
                error!(
                    "session {}: error could not be handled in {from:?}, cancelling session",
                    self.id
                );
                self.cancel.cancel();
                FireOutcome::Fatal
            }
            Decision::Unhandled => {
                warn!("session {}: {trigger:?} is not valid in {from:?}", self.id);
                follow.push(Fired::failure(&SessionError::UnhandledTrigger {
                    state: from,
                    trigger,
                }));
                FireOutcome::Unhandled
            }
        };
        (outcome, follow)
    }

    async fn exit_state(
        &mut self,
        from: ConversationState,
        to: ConversationState,
        follow: &mut Vec<Fired>,
    ) {
        if from == ConversationState::Paused && to == ConversationState::Idle {
            if let Err(e) = self.start_inputs().await {
                warn!("session {}: resuming inputs failed: {e}", self.id);
                follow.push(Fired::failure(&e));
            }
        }
    }

    async fn enter_state(
        &mut self,
        from: ConversationState,
        to: ConversationState,
        fired: Fired,
        follow: &mut Vec<Fired>,
    ) {
        use ConversationState as S;

        let result = match to {
            S::Initializing => self.enter_initializing(follow).await,
            S::Idle | S::Listening if !from.is_in(S::Idle) => {
                self.enter_idle();
                Ok(())
            }
            S::ProcessingInput => self.enter_processing_input(fired.payload, follow).await,
            S::WaitingForLlm => self.start_generation(),
            S::Interrupted => {
                let requeued = self.enter_interrupted(fired).await;
                follow.push(requeued);
                Ok(())
            }
            S::Paused => self.stop_inputs().await,
            S::Error => {
                self.enter_error(&fired.payload).await;
                follow.push(Fired::plain(Trigger::StopRequested));
                Ok(())
            }
            S::Ended => {
                self.cancel_turn(CompletionReason::Cancelled).await;
                self.teardown().await;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("session {}: entering {to:?} failed: {e}", self.id);
            follow.push(Fired::failure(&e));
        }
    }

    async fn run_internal(&mut self, action: InternalAction, payload: Payload) -> Result<()> {
        match action {
            InternalAction::StartSynthesis => self.start_synthesis(),
            InternalAction::RelayLlmChunk => {
                let Payload::Output(OutputEvent {
                    kind: OutputEventKind::LlmChunk { text },
                    ..
                }) = payload
                else {
                    return Err(SessionError::Pipeline(
                        "generator chunk without text".to_owned(),
                    ));
                };
                self.context.append_to_turn(&self.assistant.id, &text)?;
                if let Some(turn) = &self.turn {
                    if let Err(e) = turn.relay_llm(text) {
                        debug!("session {}: generator chunk not relayed: {e}", self.id);
                    }
                }
                Ok(())
            }
            InternalAction::RelayTtsChunk => {
                let Payload::Output(OutputEvent {
                    kind: OutputEventKind::TtsChunk { audio },
                    ..
                }) = payload
                else {
                    return Err(SessionError::Pipeline(
                        "synthesizer chunk without audio".to_owned(),
                    ));
                };
                if let Some(turn) = &self.turn {
                    if let Err(e) = turn.relay_tts(audio) {
                        debug!("session {}: audio chunk not relayed: {e}", self.id);
                    }
                }
                Ok(())
            }
            InternalAction::EndLlmStream => {
                let reason = match payload {
                    Payload::Output(OutputEvent {
                        kind: OutputEventKind::LlmStreamEnded { reason },
                        ..
                    }) => reason,
                    _ => CompletionReason::Completed,
                };
                self.end_generation(reason).await
            }
            InternalAction::EndTtsStream => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.complete_tts();
                }
                Ok(())
            }
        }
    }

    async fn enter_initializing(&mut self, follow: &mut Vec<Fired>) -> Result<()> {
        let sink = self.input_sink.clone().ok_or(SessionError::Disposed)?;
        let output = self.output.clone().ok_or(SessionError::Disposed)?;
        let id = self.id;
        let cancel = self.cancel.clone();

        let inputs_ready = try_join_all(self.inputs.iter().map(|adapter| {
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move {
                adapter.initialize(id, sink, cancel.clone()).await?;
                adapter.start(cancel).await
            }
        }));
        let output_ready = async {
            output.initialize(id, cancel.clone()).await?;
            output.start(cancel.clone()).await
        };
        let (inputs_ready, output_ready) = tokio::join!(inputs_ready, output_ready);
        inputs_ready?;
        output_ready?;

        for adapter in &self.inputs {
            self.context.register_participant(adapter.participant());
        }
        self.output_audio = output.supports_audio();
        info!(
            "session {id} initialized: {} input(s), output '{}' ({})",
            self.inputs.len(),
            output.adapter_id(),
            if self.output_audio { "audio" } else { "text" }
        );
        follow.push(Fired::plain(Trigger::InitializeComplete));
        Ok(())
    }

    /// Close out a turn that completed: commit the transcript, release the
    /// turn scope and report its timings.
    fn enter_idle(&mut self) {
        self.context.close_turn(CompletionReason::Completed);
        if let Some(turn) = self.turn.take() {
            let turn_id = turn.id();
            turn.release();
            self.finish_timing(turn_id, CompletionReason::Completed);
        }
    }

    async fn enter_processing_input(
        &mut self,
        payload: Payload,
        follow: &mut Vec<Fired>,
    ) -> Result<()> {
        let Payload::Input(InputEvent::Recognized {
            participant_id,
            text,
            ..
        }) = payload
        else {
            return Err(SessionError::Pipeline(
                "processing started without a final transcript".to_owned(),
            ));
        };

        self.cancel_turn(CompletionReason::Cancelled).await;

        let turn = ActiveTurn::new(TurnId::new(), &self.cancel);
        let turn_id = turn.id();
        self.latency.begin_turn(turn_id, turn.started());
        self.metrics.count_turn_started(self.id, turn_id);
        self.turn = Some(turn);

        if self.context.participant(&participant_id).is_none() {
            warn!(
                "session {}: input from unregistered participant '{participant_id}'",
                self.id
            );
            self.context.register_participant(ParticipantInfo::human(
                participant_id.clone(),
                participant_id.clone(),
            ));
        }
        self.context
            .start_turn(turn_id, &[participant_id.as_str(), self.assistant.id.as_str()])?;
        self.context.append_to_turn(&participant_id, &text)?;
        self.context.complete_turn_part(&participant_id, false)?;
        info!("session {} turn {turn_id} started: {text:?}", self.id);

        follow.push(Fired::plain(Trigger::LlmRequestSent));
        if self.output_audio {
            follow.push(Fired::plain(Trigger::TtsRequestSent));
        }
        Ok(())
    }

    fn start_generation(&mut self) -> Result<()> {
        let sink = self.output_sink.clone().ok_or(SessionError::Disposed)?;
        let turn = self
            .turn
            .as_mut()
            .ok_or_else(|| SessionError::Pipeline("no active turn to answer".to_owned()))?;
        turn.open_llm_channel();
        let turn_id = turn.id();
        let cancel = turn.token().clone();
        let request = self.context.build_request(self.id, turn_id);
        let chat = Arc::clone(&self.chat);

        let work = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move { chat.stream_response(request, sink, cancel).await }
        };
        turn.track(Stage::Llm, spawn_stage(Stage::Llm, turn_id, sink, cancel, work));
        Ok(())
    }

    fn start_synthesis(&mut self) -> Result<()> {
        let sink = self.output_sink.clone().ok_or(SessionError::Disposed)?;
        let turn = self
            .turn
            .as_mut()
            .ok_or_else(|| SessionError::Pipeline("no active turn to synthesize".to_owned()))?;
        let turn_id = turn.id();
        let text = turn.take_llm_reader().ok_or_else(|| {
            SessionError::Pipeline(format!("synthesis already started for turn {turn_id}"))
        })?;
        let audio = turn.open_tts_channel();
        let cancel = turn.token().clone();

        let tts = Arc::clone(&self.tts);
        let session_id = self.id;
        let work = {
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move { tts.synthesize(text, sink, turn_id, session_id, cancel).await }
        };
        turn.track(
            Stage::Tts,
            spawn_stage(Stage::Tts, turn_id, sink.clone(), cancel.clone(), work),
        );

        let output = if self.output_audio {
            self.output.clone()
        } else {
            None
        };
        if let Some(output) = output {
            let work = {
                let sink = sink.clone();
                let cancel = cancel.clone();
                async move { output.send_audio(audio, sink, turn_id, cancel).await }
            };
            turn.track(Stage::Audio, spawn_stage(Stage::Audio, turn_id, sink, cancel, work));
        }
        Ok(())
    }

    /// The generator finished: close its channel and the assistant's part.
    ///
    /// Text-only outputs receive the whole reply here and playback is
    /// reported immediately, so the turn completes through `Speaking`.
    async fn end_generation(&mut self, reason: CompletionReason) -> Result<()> {
        let Some(turn) = self.turn.as_mut() else {
            return Ok(());
        };
        turn.complete_llm();
        let turn_id = turn.id();

        let assistant_id = self.assistant.id.as_str();
        let reply = self
            .context
            .pending_text(assistant_id)
            .unwrap_or_default()
            .to_owned();
        if self.context.pending_turn_id() == Some(turn_id)
            && !self.context.is_part_complete(assistant_id)
        {
            self.context
                .complete_turn_part(assistant_id, reason != CompletionReason::Completed)?;
        }

        if !self.output_audio {
            let output = self.output.clone().ok_or(SessionError::Disposed)?;
            let sink = self.output_sink.clone().ok_or(SessionError::Disposed)?;
            output.deliver_text(turn_id, &reply).await?;
            sink.emit(turn_id, OutputEventKind::AudioPlaybackStarted)?;
            sink.emit(
                turn_id,
                OutputEventKind::AudioPlaybackEnded {
                    reason: CompletionReason::Completed,
                },
            )?;
        }
        Ok(())
    }

    /// Flag the interrupted turn, cancel it and queue the interrupting input
    /// again so the machine moves on to `Listening` or `ProcessingInput`.
    async fn enter_interrupted(&mut self, fired: Fired) -> Fired {
        if let Some(turn_id) = self.turn_id() {
            self.metrics.count_turn_interrupted(self.id, turn_id);
            if self.context.pending_turn_id() == Some(turn_id) {
                self.context.close_turn(CompletionReason::Cancelled);
            } else {
                self.context.mark_interrupted(turn_id);
            }
            info!(
                "session {} turn {turn_id} interrupted by {:?}",
                self.id, fired.trigger
            );
        }
        self.cancel_turn(CompletionReason::Cancelled).await;
        fired
    }

    async fn enter_error(&mut self, payload: &Payload) {
        let message = payload.error_message().unwrap_or("unspecified error");
        let turn_id = self.turn_id();
        error!("session {} error: {message}", self.id);
        self.metrics.count_error(self.id, turn_id, message);
        self.context.close_turn(CompletionReason::Error);
        self.cancel_turn(CompletionReason::Error).await;
    }

    /// Cancel the in-flight turn and discard its uncommitted transcript.
    /// No-op without an active turn.
    async fn cancel_turn(&mut self, reason: CompletionReason) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        let turn_id = turn.id();
        turn.shutdown(self.timeouts.turn_cancel()).await;
        if let Some(discarded) = self.context.abort_turn() {
            debug!(
                "session {}: discarded uncommitted transcript of turn {discarded}",
                self.id
            );
        }
        self.finish_timing(turn_id, reason);
    }

    fn finish_timing(&mut self, turn_id: TurnId, reason: CompletionReason) {
        if let Some(summary) = self.latency.finish_turn(turn_id, reason, Instant::now()) {
            info!("session {} turn {turn_id}: {summary}", self.id);
            let _ = self.events_tx.send(RuntimeEvent::TurnFinished {
                session_id: self.id,
                summary,
            });
        }
    }

    async fn start_inputs(&self) -> Result<()> {
        try_join_all(
            self.inputs
                .iter()
                .map(|adapter| adapter.start(self.cancel.clone())),
        )
        .await?;
        Ok(())
    }

    async fn stop_inputs(&self) -> Result<()> {
        try_join_all(
            self.inputs
                .iter()
                .map(|adapter| adapter.stop(self.cancel.clone())),
        )
        .await?;
        Ok(())
    }

    /// Stop and dispose every adapter, close the event streams and cancel
    /// the session token. Runs once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let inputs = std::mem::take(&mut self.inputs);
        let output = self.output.take();
        let stop = CancellationToken::new();

        let release_inputs = join_all(
            inputs
                .iter()
                .map(|adapter| release_input(adapter.as_ref(), stop.clone())),
        );
        let release_output = async {
            match &output {
                Some(adapter) => release_output(adapter.as_ref(), stop.clone()).await,
                None => Ok(()),
            }
        };
        let released = tokio::time::timeout(self.timeouts.session_shutdown(), async {
            tokio::join!(release_inputs, release_output)
        })
        .await;

        match released {
            Ok((input_results, output_result)) => {
                for (adapter, result) in inputs.iter().zip(input_results) {
                    if let Err(e) = result {
                        warn!(
                            "session {}: releasing input '{}' failed: {e}",
                            self.id,
                            adapter.adapter_id()
                        );
                    }
                }
                if let Err(e) = output_result {
                    warn!("session {}: releasing output failed: {e}", self.id);
                }
            }
            Err(_) => warn!(
                "session {}: adapters did not release within {:?}",
                self.id,
                self.timeouts.session_shutdown()
            ),
        }

        self.input_sink = None;
        self.output_sink = None;
        self.cancel.cancel();
        info!("session {} ended", self.id);
        let _ = self.events_tx.send(RuntimeEvent::SessionEnded {
            session_id: self.id,
        });
    }
}

async fn release_input(adapter: &dyn InputAdapter, cancel: CancellationToken) -> Result<()> {
    let stopped = adapter.stop(cancel).await;
    let disposed = adapter.dispose().await;
    stopped.and(disposed)
}

async fn release_output(adapter: &dyn OutputAdapter, cancel: CancellationToken) -> Result<()> {
    let stopped = adapter.stop(cancel).await;
    let disposed = adapter.dispose().await;
    stopped.and(disposed)
}

/// Spawn one stage of a turn. A failure that was not caused by cancellation
/// is published as an error event of that turn.
fn spawn_stage<F>(
    stage: Stage,
    turn_id: TurnId,
    sink: OutputSink,
    cancel: CancellationToken,
    work: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = work.await {
            if cancel.is_cancelled() {
                debug!("{stage} stage of turn {turn_id} ended after cancellation: {e}");
                return;
            }
            warn!("{stage} stage of turn {turn_id} failed: {e}");
            let _ = sink.emit(
                turn_id,
                OutputEventKind::Error {
                    message: e.to_string(),
                },
            );
        }
    })
}
