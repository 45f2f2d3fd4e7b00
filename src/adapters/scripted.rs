//! Deterministic in-process adapters.
//!
//! These back the console front end and the test suite: input is pushed by
//! hand through an [`InputHandle`], replies come from a script, synthesis is
//! a sentence-buffered passthrough and playback only counts what it "plays".
//! Every adapter keeps counters so callers can assert on lifecycle and
//! concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::traits::{
    ChatEngine, InputAdapter, OutputAdapter, SessionComponents, SessionFactory, TtsEngine,
};
use crate::conversation::context::ChatRequest;
use crate::conversation::types::{CompletionReason, ParticipantInfo, SessionId, TurnId};
use crate::error::{Result, SessionError};
use crate::pipeline::messages::{InputSink, OutputEventKind, OutputSink, SynthesizedAudio};
use crate::pipeline::relay::ChunkReader;

/// Sample rate of the silent audio produced by [`PassthroughTts`].
pub const SCRIPTED_SAMPLE_RATE: u32 = 24_000;

/// Silent samples generated per character of synthesized text.
const SAMPLES_PER_CHAR: usize = 240;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// How often each lifecycle method of an adapter was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleCounts {
    pub initialized: usize,
    pub started: usize,
    pub stopped: usize,
    pub disposed: usize,
}

#[derive(Debug, Default)]
struct Lifecycle {
    initialized: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    disposed: AtomicUsize,
}

impl Lifecycle {
    fn counts(&self) -> LifecycleCounts {
        LifecycleCounts {
            initialized: self.initialized.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
            disposed: self.disposed.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InputShared {
    sink: Mutex<Option<InputSink>>,
    listening: watch::Sender<bool>,
    lifecycle: Lifecycle,
}

/// Input adapter fed by hand through an [`InputHandle`].
#[derive(Debug)]
pub struct ChannelInput {
    id: String,
    participant: ParticipantInfo,
    fail_on_initialize: bool,
    shared: Arc<InputShared>,
}

impl ChannelInput {
    pub fn new(participant: ParticipantInfo) -> Self {
        let (listening, _) = watch::channel(false);
        Self {
            id: format!("channel:{}", participant.id),
            participant,
            fail_on_initialize: false,
            shared: Arc::new(InputShared {
                sink: Mutex::new(None),
                listening,
                lifecycle: Lifecycle::default(),
            }),
        }
    }

    /// Make `initialize` fail, as a missing capture device would.
    pub fn fail_on_initialize(mut self) -> Self {
        self.fail_on_initialize = true;
        self
    }

    pub fn handle(&self) -> InputHandle {
        InputHandle {
            participant_id: self.participant.id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl InputAdapter for ChannelInput {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn participant(&self) -> ParticipantInfo {
        self.participant.clone()
    }

    async fn initialize(
        &self,
        session_id: SessionId,
        sink: InputSink,
        _cancel: CancellationToken,
    ) -> Result<()> {
        if self.fail_on_initialize {
            return Err(SessionError::Adapter(format!(
                "input '{}' could not be opened",
                self.id
            )));
        }
        *lock(&self.shared.sink) = Some(sink);
        self.shared.lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
        debug!("input '{}' bound to session {session_id}", self.id);
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        self.shared.lifecycle.started.fetch_add(1, Ordering::SeqCst);
        self.shared.listening.send_replace(true);
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        self.shared.lifecycle.stopped.fetch_add(1, Ordering::SeqCst);
        self.shared.listening.send_replace(false);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.shared.lifecycle.disposed.fetch_add(1, Ordering::SeqCst);
        self.shared.listening.send_replace(false);
        *lock(&self.shared.sink) = None;
        Ok(())
    }
}

/// Pushes recognition results into a [`ChannelInput`].
#[derive(Debug, Clone)]
pub struct InputHandle {
    participant_id: String,
    shared: Arc<InputShared>,
}

impl InputHandle {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn is_listening(&self) -> bool {
        *self.shared.listening.borrow()
    }

    /// Wait until the session has started the adapter.
    pub async fn wait_listening(&self) {
        let mut listening = self.shared.listening.subscribe();
        let _ = listening.wait_for(|listening| *listening).await;
    }

    /// Publish a partial hypothesis.
    ///
    /// # Errors
    ///
    /// Fails while the adapter is stopped or once the session has closed it.
    pub fn recognizing(&self, text: &str) -> Result<()> {
        self.live_sink()?.recognizing(&self.participant_id, text)
    }

    /// Publish a final transcript.
    ///
    /// # Errors
    ///
    /// Fails while the adapter is stopped or once the session has closed it.
    pub fn recognized(&self, text: &str) -> Result<()> {
        self.live_sink()?
            .recognized(&self.participant_id, text, Some(1.0))
    }

    pub fn lifecycle(&self) -> LifecycleCounts {
        self.shared.lifecycle.counts()
    }

    fn live_sink(&self) -> Result<InputSink> {
        if !self.is_listening() {
            return Err(SessionError::Adapter(format!(
                "input for '{}' is not listening",
                self.participant_id
            )));
        }
        lock(&self.shared.sink).clone().ok_or_else(|| {
            SessionError::Adapter(format!(
                "input for '{}' is not bound to a session",
                self.participant_id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Reply {
    Fixed(Vec<String>),
    /// Repeat the latest user message back, one word per chunk.
    Echo,
    Fail(String),
}

#[derive(Debug, Default)]
struct ChatCounters {
    invocations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Generator that streams a scripted reply.
#[derive(Debug)]
pub struct ScriptedChat {
    reply: Reply,
    start_delay: Duration,
    chunk_delay: Duration,
    counters: ChatCounters,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    /// Reply with `chunks`, in order, to every request.
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_reply(Reply::Fixed(chunks.into_iter().map(Into::into).collect()))
    }

    /// Reply with the latest user message.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    /// Fail every request after announcing the stream.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_reply(Reply::Fail(message.into()))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            start_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            counters: ChatCounters::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Wait this long before the stream starts.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Wait this long before each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn invocations(&self) -> usize {
        self.counters.invocations.load(Ordering::SeqCst)
    }

    /// Streams currently running.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of streams that ever ran at once.
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    fn chunks_for(&self, request: &ChatRequest) -> Vec<String> {
        match &self.reply {
            Reply::Fixed(chunks) => chunks.clone(),
            Reply::Echo => {
                let said = request
                    .last_user_message()
                    .map(|message| match message.split_once(']') {
                        Some((_, text)) if message.starts_with('[') => text,
                        _ => message,
                    })
                    .unwrap_or_default();
                let words: Vec<&str> = said.split_whitespace().collect();
                let mut chunks = vec!["You said:".to_owned()];
                chunks.extend(words.into_iter().map(|word| format!(" {word}")));
                chunks
            }
            Reply::Fail(_) => Vec::new(),
        }
    }

    /// Sleep for `delay`; `false` if cancelled first.
    async fn delay(delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[async_trait]
impl ChatEngine for ScriptedChat {
    async fn stream_response(
        &self,
        request: ChatRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let turn_id = request.turn_id;
        self.counters.invocations.fetch_add(1, Ordering::SeqCst);
        let running = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.counters.active);
        self.counters.max_active.fetch_max(running, Ordering::SeqCst);

        let chunks = self.chunks_for(&request);
        lock(&self.requests).push(request);

        let mut reason = CompletionReason::Completed;
        if Self::delay(self.start_delay, &cancel).await {
            sink.emit(turn_id, OutputEventKind::LlmStreamStarted)?;
            if let Reply::Fail(message) = &self.reply {
                return Err(SessionError::Generator(message.clone()));
            }
            for text in chunks {
                if !Self::delay(self.chunk_delay, &cancel).await {
                    reason = CompletionReason::Cancelled;
                    break;
                }
                sink.emit(turn_id, OutputEventKind::LlmChunk { text })?;
            }
        } else {
            reason = CompletionReason::Cancelled;
        }

        if reason == CompletionReason::Cancelled {
            self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!("scripted reply for turn {turn_id} cancelled");
        } else {
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
        }
        // Nobody may be listening once the turn is cancelled.
        let _ = sink.emit(turn_id, OutputEventKind::LlmStreamEnded { reason });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// Synthesizer that turns each sentence into silent audio.
#[derive(Debug, Default)]
pub struct PassthroughTts {
    synthesized: AtomicUsize,
}

impl PassthroughTts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audio chunks produced so far, across all turns.
    pub fn synthesized(&self) -> usize {
        self.synthesized.load(Ordering::SeqCst)
    }

    fn render(&self, text: &str) -> SynthesizedAudio {
        self.synthesized.fetch_add(1, Ordering::SeqCst);
        SynthesizedAudio {
            samples: vec![0.0; text.chars().count() * SAMPLES_PER_CHAR],
            sample_rate: SCRIPTED_SAMPLE_RATE,
            text: text.to_owned(),
        }
    }
}

fn ends_sentence(text: &str) -> bool {
    text.ends_with('\n') || text.trim_end().ends_with(['.', '!', '?'])
}

#[async_trait]
impl TtsEngine for PassthroughTts {
    async fn synthesize(
        &self,
        mut text: ChunkReader<String>,
        sink: OutputSink,
        turn_id: TurnId,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!("synthesizing turn {turn_id} of session {session_id}");
        sink.emit(turn_id, OutputEventKind::TtsStreamStarted)?;

        let mut sentence = String::new();
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => None,
                chunk = text.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            sentence.push_str(&chunk);
            if ends_sentence(&sentence) {
                let audio = self.render(&sentence);
                sentence.clear();
                sink.emit(turn_id, OutputEventKind::TtsChunk { audio })?;
            }
        }

        let reason = if cancel.is_cancelled() || text.is_cancelled() {
            CompletionReason::Cancelled
        } else {
            if !sentence.trim().is_empty() {
                let audio = self.render(&sentence);
                sink.emit(turn_id, OutputEventKind::TtsChunk { audio })?;
            }
            CompletionReason::Completed
        };
        let _ = sink.emit(turn_id, OutputEventKind::TtsStreamEnded { reason });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Audio output that "plays" chunks instantly and records their text.
///
/// A held output blocks after the first chunk of every turn until
/// [`release`](Self::release) is called, keeping the session in `Speaking`.
#[derive(Debug)]
pub struct ScriptedAudioOutput {
    held: watch::Sender<bool>,
    played: Mutex<Vec<String>>,
    interrupted: AtomicUsize,
    lifecycle: Lifecycle,
}

impl Default for ScriptedAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAudioOutput {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            held,
            played: Mutex::new(Vec::new()),
            interrupted: AtomicUsize::new(0),
            lifecycle: Lifecycle::default(),
        }
    }

    /// An output that holds playback until released.
    pub fn held() -> Self {
        let output = Self::new();
        output.held.send_replace(true);
        output
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Text of every chunk played, in order.
    pub fn played(&self) -> Vec<String> {
        lock(&self.played).clone()
    }

    /// Playbacks cut short by cancellation.
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> LifecycleCounts {
        self.lifecycle.counts()
    }

    /// Wait until released; `false` if cancelled first.
    async fn wait_released(&self, cancel: &CancellationToken) -> bool {
        let mut held = self.held.subscribe();
        tokio::select! {
            () = cancel.cancelled() => false,
            released = held.wait_for(|held| !*held) => released.is_ok(),
        }
    }
}

#[async_trait]
impl OutputAdapter for ScriptedAudioOutput {
    fn adapter_id(&self) -> &str {
        "scripted-audio"
    }

    async fn initialize(&self, _session_id: SessionId, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_audio(&self) -> bool {
        true
    }

    async fn send_audio(
        &self,
        mut audio: ChunkReader<SynthesizedAudio>,
        sink: OutputSink,
        turn_id: TurnId,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut started = false;
        let completed = loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => None,
                chunk = audio.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break !(cancel.is_cancelled() || audio.is_cancelled());
            };
            if !started {
                sink.emit(turn_id, OutputEventKind::AudioPlaybackStarted)?;
                started = true;
            }
            if !self.wait_released(&cancel).await {
                break false;
            }
            lock(&self.played).push(chunk.text);
        };

        if !completed {
            self.interrupted.fetch_add(1, Ordering::SeqCst);
            let _ = sink.emit(
                turn_id,
                OutputEventKind::AudioPlaybackEnded {
                    reason: CompletionReason::Cancelled,
                },
            );
            return Ok(());
        }
        if !started {
            sink.emit(turn_id, OutputEventKind::AudioPlaybackStarted)?;
        }
        sink.emit(
            turn_id,
            OutputEventKind::AudioPlaybackEnded {
                reason: CompletionReason::Completed,
            },
        )?;
        Ok(())
    }
}

/// Text-only output; collects complete replies and optionally forwards them.
#[derive(Debug, Default)]
pub struct TextOutput {
    delivered: Mutex<Vec<String>>,
    forward: Option<mpsc::UnboundedSender<String>>,
    lifecycle: Lifecycle,
    started: AtomicBool,
}

impl TextOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also send every reply to `tx`.
    pub fn forwarding(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            forward: Some(tx),
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        lock(&self.delivered).clone()
    }

    pub fn lifecycle(&self) -> LifecycleCounts {
        self.lifecycle.counts()
    }
}

#[async_trait]
impl OutputAdapter for TextOutput {
    fn adapter_id(&self) -> &str {
        "text"
    }

    async fn initialize(&self, _session_id: SessionId, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.started.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _cancel: CancellationToken) -> Result<()> {
        self.lifecycle.stopped.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deliver_text(&self, turn_id: TurnId, text: &str) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(SessionError::Playback(format!(
                "text output is not started (turn {turn_id})"
            )));
        }
        lock(&self.delivered).push(text.to_owned());
        if let Some(tx) = &self.forward {
            tx.send(text.to_owned())
                .map_err(|_| SessionError::Channel("reply receiver dropped".to_owned()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Output built for one scripted session.
#[derive(Debug, Clone)]
pub enum ScriptedOutput {
    Audio(Arc<ScriptedAudioOutput>),
    Text(Arc<TextOutput>),
}

/// What a [`ScriptedFactory`] built for one session.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    pub input: InputHandle,
    pub output: ScriptedOutput,
}

#[derive(Debug, Clone)]
enum OutputMode {
    Audio { held: bool },
    Text(Option<mpsc::UnboundedSender<String>>),
}

/// Builds scripted components for every session, sharing one generator and
/// one synthesizer.
#[derive(Debug)]
pub struct ScriptedFactory {
    participant: ParticipantInfo,
    chat: Arc<ScriptedChat>,
    tts: Arc<PassthroughTts>,
    output: OutputMode,
    sessions: Mutex<HashMap<SessionId, ScriptedSession>>,
}

impl ScriptedFactory {
    /// Sessions with one human participant and audio playback.
    pub fn new(participant: ParticipantInfo, chat: Arc<ScriptedChat>) -> Self {
        Self {
            participant,
            chat,
            tts: Arc::new(PassthroughTts::new()),
            output: OutputMode::Audio { held: false },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Hold playback in every session until its output is released.
    pub fn with_held_audio(mut self) -> Self {
        self.output = OutputMode::Audio { held: true };
        self
    }

    /// Deliver replies as text, optionally forwarding them to `tx`.
    pub fn with_text_output(mut self, tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        self.output = OutputMode::Text(tx);
        self
    }

    pub fn chat(&self) -> &Arc<ScriptedChat> {
        &self.chat
    }

    pub fn tts(&self) -> &Arc<PassthroughTts> {
        &self.tts
    }

    /// Handles for the session built under `id`.
    pub fn session(&self, id: SessionId) -> Option<ScriptedSession> {
        lock(&self.sessions).get(&id).cloned()
    }
}

impl SessionFactory for ScriptedFactory {
    fn components(&self, session_id: SessionId) -> Result<SessionComponents> {
        let input = ChannelInput::new(self.participant.clone());
        let handle = input.handle();
        let (output, scripted) = match &self.output {
            OutputMode::Audio { held } => {
                let audio = Arc::new(if *held {
                    ScriptedAudioOutput::held()
                } else {
                    ScriptedAudioOutput::new()
                });
                let output: Arc<dyn OutputAdapter> = audio.clone();
                (output, ScriptedOutput::Audio(audio))
            }
            OutputMode::Text(forward) => {
                let text = Arc::new(match forward {
                    Some(tx) => TextOutput::forwarding(tx.clone()),
                    None => TextOutput::new(),
                });
                let output: Arc<dyn OutputAdapter> = text.clone();
                (output, ScriptedOutput::Text(text))
            }
        };

        lock(&self.sessions).insert(
            session_id,
            ScriptedSession {
                input: handle,
                output: scripted,
            },
        );
        Ok(SessionComponents {
            inputs: vec![Arc::new(input)],
            output,
            chat: self.chat.clone(),
            tts: self.tts.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::conversation::context::{ChatRequestMessage, ChatRole};
    use crate::pipeline::messages::OutputEvent;
    use crate::pipeline::relay::chunk_channel;

    fn output_sink() -> (OutputSink, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink::new(SessionId::new(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutputEvent>) -> Vec<OutputEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            session_id: SessionId::new(),
            turn_id: TurnId::new(),
            messages: vec![ChatRequestMessage {
                role: ChatRole::User,
                content: format!("[User]{text}"),
            }],
        }
    }

    #[tokio::test]
    async fn handle_refuses_input_until_started() {
        let input = ChannelInput::new(ParticipantInfo::human("user", "User"));
        let handle = input.handle();
        assert!(handle.recognized("too early").is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let session_id = SessionId::new();
        input
            .initialize(session_id, InputSink::new(session_id, tx), cancel.clone())
            .await
            .unwrap();
        input.start(cancel.clone()).await.unwrap();
        handle.wait_listening().await;
        handle.recognized("hello").unwrap();
        assert_eq!(rx.try_recv().unwrap().text(), "hello");

        input.stop(cancel).await.unwrap();
        assert!(handle.recognizing("hel").is_err());
        assert_eq!(
            handle.lifecycle(),
            LifecycleCounts {
                initialized: 1,
                started: 1,
                stopped: 1,
                disposed: 0,
            }
        );
    }

    #[tokio::test]
    async fn scripted_chat_streams_chunks_in_order() {
        let chat = ScriptedChat::new(["H", "i"]);
        let (sink, mut rx) = output_sink();
        chat.stream_response(request("hi"), sink, CancellationToken::new())
            .await
            .unwrap();

        let kinds = drain(&mut rx);
        assert!(matches!(kinds[0], OutputEventKind::LlmStreamStarted));
        let texts: Vec<_> = kinds
            .iter()
            .filter_map(|k| match k {
                OutputEventKind::LlmChunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["H", "i"]);
        assert!(matches!(
            kinds.last(),
            Some(OutputEventKind::LlmStreamEnded {
                reason: CompletionReason::Completed
            })
        ));
        assert_eq!(chat.completed(), 1);
        assert_eq!(chat.active(), 0);
    }

    #[tokio::test]
    async fn echo_strips_speaker_label() {
        let chat = ScriptedChat::echo();
        assert_eq!(
            chat.chunks_for(&request("good morning")).concat(),
            "You said: good morning"
        );
    }

    #[tokio::test]
    async fn cancelled_chat_reports_cancellation() {
        let chat = ScriptedChat::new(["a", "b"]).with_start_delay(Duration::from_secs(30));
        let (sink, mut rx) = output_sink();
        let cancel = CancellationToken::new();
        cancel.cancel();
        chat.stream_response(request("x"), sink, cancel).await.unwrap();

        assert_eq!(chat.cancelled(), 1);
        let kinds = drain(&mut rx);
        assert!(matches!(
            kinds.as_slice(),
            [OutputEventKind::LlmStreamEnded {
                reason: CompletionReason::Cancelled
            }]
        ));
    }

    #[tokio::test]
    async fn failing_chat_returns_generator_error() {
        let chat = ScriptedChat::failing("model offline");
        let (sink, _rx) = output_sink();
        let err = chat
            .stream_response(request("x"), sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Generator(_)));
    }

    #[tokio::test]
    async fn passthrough_buffers_until_sentence_end() {
        let tts = PassthroughTts::new();
        let (mut writer, reader) = chunk_channel();
        writer.send("Hello".to_owned()).unwrap();
        writer.send(" there.".to_owned()).unwrap();
        writer.send(" Bye".to_owned()).unwrap();
        writer.complete();

        let (sink, mut rx) = output_sink();
        let session_id = sink.session_id();
        tts.synthesize(reader, sink, TurnId::new(), session_id, CancellationToken::new())
            .await
            .unwrap();

        let texts: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|k| match k {
                OutputEventKind::TtsChunk { audio } => Some(audio.text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["Hello there.", " Bye"]);
        assert_eq!(tts.synthesized(), 2);
    }

    #[tokio::test]
    async fn audio_output_reports_start_and_end_for_empty_reply() {
        let output = ScriptedAudioOutput::new();
        let (mut writer, reader) = chunk_channel::<SynthesizedAudio>();
        writer.complete();
        let (sink, mut rx) = output_sink();
        output
            .send_audio(reader, sink, TurnId::new(), CancellationToken::new())
            .await
            .unwrap();

        let kinds = drain(&mut rx);
        assert!(matches!(
            kinds.as_slice(),
            [
                OutputEventKind::AudioPlaybackStarted,
                OutputEventKind::AudioPlaybackEnded {
                    reason: CompletionReason::Completed
                }
            ]
        ));
    }

    #[tokio::test]
    async fn held_output_stops_on_cancel() {
        let output = Arc::new(ScriptedAudioOutput::held());
        let (writer, reader) = chunk_channel();
        writer
            .send(SynthesizedAudio {
                samples: vec![0.0; 8],
                sample_rate: SCRIPTED_SAMPLE_RATE,
                text: "Hi.".to_owned(),
            })
            .unwrap();
        let (sink, mut rx) = output_sink();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let output = Arc::clone(&output);
            let cancel = cancel.clone();
            async move { output.send_audio(reader, sink, TurnId::new(), cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(output.played().is_empty());
        assert_eq!(output.interrupted(), 1);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(OutputEventKind::AudioPlaybackEnded {
                reason: CompletionReason::Cancelled
            })
        ));
        drop(writer);
    }

    #[tokio::test]
    async fn factory_records_session_handles() {
        let factory = ScriptedFactory::new(
            ParticipantInfo::human("user", "User"),
            Arc::new(ScriptedChat::new(["ok"])),
        )
        .with_text_output(None);
        let id = SessionId::new();
        let components = factory.components(id).unwrap();
        assert_eq!(components.inputs.len(), 1);
        assert!(!components.output.supports_audio());

        let session = factory.session(id).unwrap();
        assert_eq!(session.input.participant_id(), "user");
        assert!(matches!(session.output, ScriptedOutput::Text(_)));
    }
}
