//! Metrics collection for conversation sessions.
//!
//! The [`MetricsCollector`] trait keeps the session core decoupled from any
//! particular metrics backend. Every measurement is tagged with the session
//! and, where one exists, the turn it belongs to.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parley::metrics::{MetricsCollector, NoopMetrics};
//!
//! let metrics: Arc<dyn MetricsCollector> = Arc::new(NoopMetrics);
//! # let _ = metrics;
//! ```
//!
//! # Thread Safety
//!
//! All methods take `&self` so a single collector can be shared by every
//! session an orchestrator runs.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::conversation::types::{CompletionReason, SessionId, TurnId};

/// Pipeline stage a duration measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// First partial recognition to final transcript.
    Stt,
    /// Generator stream start to end.
    Llm,
    /// Synthesizer stream start to end.
    Tts,
    /// Playback start to end.
    Audio,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Audio => "audio",
        };
        f.write_str(name)
    }
}

/// Metrics collection interface for conversation sessions.
///
/// ## Counters
/// - [`count_turn_started`](MetricsCollector::count_turn_started)
/// - [`count_turn_interrupted`](MetricsCollector::count_turn_interrupted)
/// - [`count_error`](MetricsCollector::count_error)
///
/// ## Latency Recording
/// - [`record_stage_duration_ms`](MetricsCollector::record_stage_duration_ms)
/// - [`record_first_audio_latency_ms`](MetricsCollector::record_first_audio_latency_ms)
/// - [`record_turn_duration_ms`](MetricsCollector::record_turn_duration_ms)
pub trait MetricsCollector: Send + Sync {
    /// A new turn began processing user input.
    fn count_turn_started(&self, session_id: SessionId, turn_id: TurnId);

    /// A turn was cancelled by user barge-in.
    fn count_turn_interrupted(&self, session_id: SessionId, turn_id: TurnId);

    /// Duration of one pipeline stage.
    ///
    /// `turn_id` is `None` for speech recognition, which happens before a turn exists.
    fn record_stage_duration_ms(
        &self,
        session_id: SessionId,
        turn_id: Option<TurnId>,
        stage: Stage,
        duration_ms: u64,
        reason: CompletionReason,
    );

    /// Time from turn start to the first audible output.
    fn record_first_audio_latency_ms(&self, session_id: SessionId, turn_id: TurnId, latency_ms: u64);

    /// Whole-turn duration with the overall outcome.
    fn record_turn_duration_ms(
        &self,
        session_id: SessionId,
        turn_id: TurnId,
        duration_ms: u64,
        reason: CompletionReason,
    );

    /// An error drove the session into its error state.
    fn count_error(&self, session_id: SessionId, turn_id: Option<TurnId>, message: &str);
}

/// No-op metrics collector (default implementation).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn count_turn_started(&self, _session_id: SessionId, _turn_id: TurnId) {
        // No-op
    }

    fn count_turn_interrupted(&self, _session_id: SessionId, _turn_id: TurnId) {
        // No-op
    }

    fn record_stage_duration_ms(
        &self,
        _session_id: SessionId,
        _turn_id: Option<TurnId>,
        _stage: Stage,
        _duration_ms: u64,
        _reason: CompletionReason,
    ) {
        // No-op
    }

    fn record_first_audio_latency_ms(
        &self,
        _session_id: SessionId,
        _turn_id: TurnId,
        _latency_ms: u64,
    ) {
        // No-op
    }

    fn record_turn_duration_ms(
        &self,
        _session_id: SessionId,
        _turn_id: TurnId,
        _duration_ms: u64,
        _reason: CompletionReason,
    ) {
        // No-op
    }

    fn count_error(&self, _session_id: SessionId, _turn_id: Option<TurnId>, _message: &str) {
        // No-op
    }
}

/// One recorded whole-turn measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnRecord {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub duration_ms: u64,
    pub reason: CompletionReason,
}

/// Point-in-time copy of a [`CountingMetrics`] collector.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub turns_started: u64,
    pub turns_interrupted: u64,
    pub errors: u64,
    pub first_audio_samples: u64,
    pub stage_samples: Vec<(Stage, u64, CompletionReason)>,
    pub turns: Vec<TurnRecord>,
}

/// In-process collector that keeps counters and raw samples.
///
/// Used by the demo binary's summary and by tests.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    turns_started: AtomicU64,
    turns_interrupted: AtomicU64,
    errors: AtomicU64,
    first_audio_samples: AtomicU64,
    stage_samples: Mutex<Vec<(Stage, u64, CompletionReason)>>,
    turns: Mutex<Vec<TurnRecord>>,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns_started(&self) -> u64 {
        self.turns_started.load(Ordering::Relaxed)
    }

    pub fn turns_interrupted(&self) -> u64 {
        self.turns_interrupted.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns_started: self.turns_started(),
            turns_interrupted: self.turns_interrupted(),
            errors: self.errors(),
            first_audio_samples: self.first_audio_samples.load(Ordering::Relaxed),
            stage_samples: self
                .stage_samples
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
            turns: self.turns.lock().map(|t| t.clone()).unwrap_or_default(),
        }
    }
}

impl MetricsCollector for CountingMetrics {
    fn count_turn_started(&self, _session_id: SessionId, _turn_id: TurnId) {
        self.turns_started.fetch_add(1, Ordering::Relaxed);
    }

    fn count_turn_interrupted(&self, _session_id: SessionId, _turn_id: TurnId) {
        self.turns_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stage_duration_ms(
        &self,
        _session_id: SessionId,
        _turn_id: Option<TurnId>,
        stage: Stage,
        duration_ms: u64,
        reason: CompletionReason,
    ) {
        if let Ok(mut samples) = self.stage_samples.lock() {
            samples.push((stage, duration_ms, reason));
        }
    }

    fn record_first_audio_latency_ms(
        &self,
        _session_id: SessionId,
        _turn_id: TurnId,
        _latency_ms: u64,
    ) {
        self.first_audio_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_turn_duration_ms(
        &self,
        session_id: SessionId,
        turn_id: TurnId,
        duration_ms: u64,
        reason: CompletionReason,
    ) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push(TurnRecord {
                session_id,
                turn_id,
                duration_ms,
                reason,
            });
        }
    }

    fn count_error(&self, _session_id: SessionId, _turn_id: Option<TurnId>, _message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Helper to convert [`Duration`] to milliseconds as `u64`.
pub fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
