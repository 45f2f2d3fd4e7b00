use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::conversation::context::ChatRequest;
use crate::conversation::types::{ParticipantInfo, SessionId, TurnId};
use crate::error::{Result, SessionError};
use crate::pipeline::messages::{InputSink, OutputSink, SynthesizedAudio};
use crate::pipeline::relay::ChunkReader;

/// Source of speech-recognition events for one human participant.
#[async_trait]
pub trait InputAdapter: Send + Sync {
    /// Stable adapter identifier (e.g. `microphone`, `console`).
    fn adapter_id(&self) -> &str;

    /// Participant whose speech this adapter recognizes.
    fn participant(&self) -> ParticipantInfo;

    /// Bind the adapter to a session. Events go to `sink`.
    async fn initialize(
        &self,
        session_id: SessionId,
        sink: InputSink,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Begin publishing events.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop publishing events. May be followed by another `start`.
    async fn stop(&self, cancel: CancellationToken) -> Result<()>;

    /// Release everything. Called once, after the final `stop`.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Destination for the assistant's reply.
///
/// Audio-capable adapters consume synthesized audio through [`send_audio`];
/// text-only adapters receive the finished reply through [`deliver_text`].
///
/// [`send_audio`]: OutputAdapter::send_audio
/// [`deliver_text`]: OutputAdapter::deliver_text
#[async_trait]
pub trait OutputAdapter: Send + Sync {
    fn adapter_id(&self) -> &str;

    async fn initialize(&self, session_id: SessionId, cancel: CancellationToken) -> Result<()>;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self, cancel: CancellationToken) -> Result<()>;

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    /// Whether this adapter plays synthesized audio.
    fn supports_audio(&self) -> bool {
        false
    }

    /// Play a turn's audio until the reader ends or `cancel` fires.
    ///
    /// Publishes `AudioPlaybackStarted` when the first chunk is audible and
    /// `AudioPlaybackEnded` when playback stops.
    async fn send_audio(
        &self,
        audio: ChunkReader<SynthesizedAudio>,
        sink: OutputSink,
        turn_id: TurnId,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _ = (audio, sink, turn_id, cancel);
        Err(SessionError::Playback(format!(
            "output '{}' does not play audio",
            self.adapter_id()
        )))
    }

    /// Receive the complete reply text of a turn.
    async fn deliver_text(&self, turn_id: TurnId, text: &str) -> Result<()> {
        let _ = (turn_id, text);
        Ok(())
    }
}

/// Streaming text generator.
#[async_trait]
pub trait ChatEngine: Send + Sync {
    /// Stream a reply for `request`.
    ///
    /// Publishes `LlmStreamStarted`, one `LlmChunk` per fragment, then
    /// `LlmStreamEnded` on `sink`, all tagged with `request.turn_id`.
    async fn stream_response(
        &self,
        request: ChatRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Streaming speech synthesizer.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize text fragments from `text` until it ends or `cancel` fires.
    ///
    /// Publishes `TtsStreamStarted`, `TtsChunk`s and `TtsStreamEnded` on `sink`.
    async fn synthesize(
        &self,
        text: ChunkReader<String>,
        sink: OutputSink,
        turn_id: TurnId,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Everything a session drives.
#[derive(Clone)]
pub struct SessionComponents {
    pub inputs: Vec<Arc<dyn InputAdapter>>,
    pub output: Arc<dyn OutputAdapter>,
    pub chat: Arc<dyn ChatEngine>,
    pub tts: Arc<dyn TtsEngine>,
}

/// Builds the collaborators for each new session.
pub trait SessionFactory: Send + Sync {
    fn components(&self, session_id: SessionId) -> Result<SessionComponents>;
}
