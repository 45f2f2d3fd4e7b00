//! Typed events flowing into and out of a conversation session.
//!
//! Input events come from speech recognition; output events come from the
//! generator, the synthesizer and the output adapter. Both are immutable once
//! published and are consumed in arrival order by the session's ingestion loops.

use std::time::Instant;

use tokio::sync::mpsc;

use crate::conversation::state_machine::Trigger;
use crate::conversation::types::{CompletionReason, SessionId, TurnId};
use crate::error::{Result, SessionError};

/// A chunk of synthesized audio ready for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Audio samples (mono, f32).
    pub samples: Vec<f32>,
    /// Sample rate of the audio.
    pub sample_rate: u32,
    /// Text this chunk was synthesized from.
    pub text: String,
}

/// Speech-recognition result delivered by an input adapter.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// Partial hypothesis while the user is still speaking.
    Recognizing {
        session_id: SessionId,
        participant_id: String,
        text: String,
        at: Instant,
    },
    /// Final transcript for one speech segment.
    Recognized {
        session_id: SessionId,
        participant_id: String,
        text: String,
        confidence: Option<f32>,
        at: Instant,
    },
}

impl InputEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Recognizing { session_id, .. } | Self::Recognized { session_id, .. } => {
                *session_id
            }
        }
    }

    pub fn participant_id(&self) -> &str {
        match self {
            Self::Recognizing { participant_id, .. } | Self::Recognized { participant_id, .. } => {
                participant_id
            }
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Recognizing { text, .. } | Self::Recognized { text, .. } => text,
        }
    }

    pub fn at(&self) -> Instant {
        match self {
            Self::Recognizing { at, .. } | Self::Recognized { at, .. } => *at,
        }
    }

    /// Trigger this event fires.
    pub fn trigger(&self) -> Trigger {
        match self {
            Self::Recognizing { .. } => Trigger::InputDetected,
            Self::Recognized { .. } => Trigger::InputFinalized,
        }
    }
}

/// What happened in the generator, synthesizer or output adapter.
#[derive(Debug, Clone)]
pub enum OutputEventKind {
    LlmStreamStarted,
    LlmChunk { text: String },
    LlmStreamEnded { reason: CompletionReason },
    TtsStreamStarted,
    TtsChunk { audio: SynthesizedAudio },
    TtsStreamEnded { reason: CompletionReason },
    AudioPlaybackStarted,
    AudioPlaybackEnded { reason: CompletionReason },
    Error { message: String },
}

impl OutputEventKind {
    /// Trigger this event fires.
    pub fn trigger(&self) -> Trigger {
        match self {
            Self::LlmStreamStarted => Trigger::LlmStreamStarted,
            Self::LlmChunk { .. } => Trigger::LlmStreamChunkReceived,
            Self::LlmStreamEnded { .. } => Trigger::LlmStreamEnded,
            Self::TtsStreamStarted => Trigger::TtsStreamStarted,
            Self::TtsChunk { .. } => Trigger::TtsStreamChunkReceived,
            Self::TtsStreamEnded { .. } => Trigger::TtsStreamEnded,
            Self::AudioPlaybackStarted => Trigger::AudioStreamStarted,
            Self::AudioPlaybackEnded { .. } => Trigger::AudioStreamEnded,
            Self::Error { .. } => Trigger::ErrorOccurred,
        }
    }
}

/// A published output event.
///
/// `turn_id` is `None` only for session-level errors raised outside a turn.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub at: Instant,
    pub kind: OutputEventKind,
}

impl OutputEvent {
    pub fn trigger(&self) -> Trigger {
        self.kind.trigger()
    }
}

/// Write half of a session's input-event stream, handed to input adapters.
#[derive(Debug, Clone)]
pub struct InputSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<InputEvent>,
}

impl InputSink {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<InputEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Publish a partial recognition result.
    pub fn recognizing(&self, participant_id: &str, text: &str) -> Result<()> {
        self.send(InputEvent::Recognizing {
            session_id: self.session_id,
            participant_id: participant_id.to_owned(),
            text: text.to_owned(),
            at: Instant::now(),
        })
    }

    /// Publish a final recognition result.
    pub fn recognized(&self, participant_id: &str, text: &str, confidence: Option<f32>) -> Result<()> {
        self.send(InputEvent::Recognized {
            session_id: self.session_id,
            participant_id: participant_id.to_owned(),
            text: text.to_owned(),
            confidence,
            at: Instant::now(),
        })
    }

    pub fn send(&self, event: InputEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| SessionError::Channel("input event stream closed".to_owned()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Write half of a session's output-event stream, handed to the generator,
/// the synthesizer and the output adapter.
#[derive(Debug, Clone)]
pub struct OutputSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl OutputSink {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<OutputEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Publish an event belonging to `turn_id`.
    pub fn emit(&self, turn_id: TurnId, kind: OutputEventKind) -> Result<()> {
        self.send(OutputEvent {
            session_id: self.session_id,
            turn_id: Some(turn_id),
            at: Instant::now(),
            kind,
        })
    }

    /// Publish a session-level error not tied to any turn.
    pub fn session_error(&self, message: impl Into<String>) -> Result<()> {
        self.send(OutputEvent {
            session_id: self.session_id,
            turn_id: None,
            at: Instant::now(),
            kind: OutputEventKind::Error {
                message: message.into(),
            },
        })
    }

    pub fn send(&self, event: OutputEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| SessionError::Channel("output event stream closed".to_owned()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
