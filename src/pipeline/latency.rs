//! Per-turn latency bookkeeping.
//!
//! The output loop feeds every event through [`LatencyTracker`] before the
//! trigger is fired, so timings reflect arrival time rather than dispatch time.
//! Stage durations and first-audio latency go to the configured
//! [`MetricsCollector`]; the turn summary is returned for logging.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conversation::types::{CompletionReason, SessionId, TurnId};
use crate::metrics::{MetricsCollector, Stage, duration_to_ms};
use crate::pipeline::messages::{InputEvent, OutputEvent, OutputEventKind};

#[derive(Debug, Clone, Copy, Default)]
struct StageTimer {
    started: Option<Instant>,
    ended: Option<Instant>,
}

impl StageTimer {
    fn start(&mut self, at: Instant) {
        if self.started.is_none() {
            self.started = Some(at);
        }
    }

    /// Stop the timer, returning the elapsed time the first time it is stopped.
    fn stop(&mut self, at: Instant) -> Option<Duration> {
        if self.ended.is_some() {
            return None;
        }
        let started = self.started?;
        self.ended = Some(at);
        Some(at.saturating_duration_since(started))
    }

    fn elapsed(&self) -> Option<Duration> {
        match (self.started, self.ended) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    fn is_running(&self) -> bool {
        self.started.is_some() && self.ended.is_none()
    }
}

#[derive(Debug, Clone)]
struct TurnTimings {
    started: Instant,
    llm: StageTimer,
    tts: StageTimer,
    audio: StageTimer,
    first_audio: Option<Duration>,
    reason: CompletionReason,
}

impl TurnTimings {
    fn timer(&mut self, stage: Stage) -> Option<&mut StageTimer> {
        match stage {
            Stage::Llm => Some(&mut self.llm),
            Stage::Tts => Some(&mut self.tts),
            Stage::Audio => Some(&mut self.audio),
            Stage::Stt => None,
        }
    }
}

/// Timing summary for one finished turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTimingSummary {
    pub turn_id: TurnId,
    pub llm: Option<Duration>,
    pub tts: Option<Duration>,
    pub audio: Option<Duration>,
    pub first_audio: Option<Duration>,
    pub total: Duration,
    pub reason: CompletionReason,
}

impl fmt::Display for TurnTimingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ms(d: Option<Duration>) -> String {
            d.map_or_else(|| "-".to_owned(), |d| format!("{}ms", duration_to_ms(d)))
        }
        write!(
            f,
            "llm {} | tts {} | audio {} | first audio {} | total {}ms ({})",
            ms(self.llm),
            ms(self.tts),
            ms(self.audio),
            ms(self.first_audio),
            duration_to_ms(self.total),
            self.reason
        )
    }
}

/// Latency bookkeeping for one session, keyed by turn.
pub struct LatencyTracker {
    session_id: SessionId,
    metrics: Arc<dyn MetricsCollector>,
    turns: HashMap<TurnId, TurnTimings>,
    stt_started: Option<Instant>,
}

impl LatencyTracker {
    pub fn new(session_id: SessionId, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self {
            session_id,
            metrics,
            turns: HashMap::new(),
            stt_started: None,
        }
    }

    /// Track speech-segment timing: first partial to final transcript.
    pub fn observe_input(&mut self, event: &InputEvent) {
        match event {
            InputEvent::Recognizing { at, .. } => {
                self.stt_started.get_or_insert(*at);
            }
            InputEvent::Recognized { at, .. } => {
                let started = self.stt_started.take().unwrap_or(*at);
                self.metrics.record_stage_duration_ms(
                    self.session_id,
                    None,
                    Stage::Stt,
                    duration_to_ms(at.saturating_duration_since(started)),
                    CompletionReason::Completed,
                );
            }
        }
    }

    /// Start timing a new turn.
    pub fn begin_turn(&mut self, turn_id: TurnId, at: Instant) {
        self.turns.insert(
            turn_id,
            TurnTimings {
                started: at,
                llm: StageTimer::default(),
                tts: StageTimer::default(),
                audio: StageTimer::default(),
                first_audio: None,
                reason: CompletionReason::Completed,
            },
        );
    }

    pub fn is_tracking(&self, turn_id: TurnId) -> bool {
        self.turns.contains_key(&turn_id)
    }

    /// Update stage timers from an output event of a tracked turn.
    pub fn observe_output(&mut self, event: &OutputEvent) {
        let Some(turn_id) = event.turn_id else {
            return;
        };
        let Some(timings) = self.turns.get_mut(&turn_id) else {
            return;
        };
        let at = event.at;
        let (stage, ended) = match &event.kind {
            OutputEventKind::LlmStreamStarted | OutputEventKind::LlmChunk { .. } => {
                (Stage::Llm, None)
            }
            OutputEventKind::LlmStreamEnded { reason } => (Stage::Llm, Some(*reason)),
            OutputEventKind::TtsStreamStarted | OutputEventKind::TtsChunk { .. } => {
                (Stage::Tts, None)
            }
            OutputEventKind::TtsStreamEnded { reason } => (Stage::Tts, Some(*reason)),
            OutputEventKind::AudioPlaybackStarted => {
                if timings.first_audio.is_none() {
                    let latency = at.saturating_duration_since(timings.started);
                    timings.first_audio = Some(latency);
                    self.metrics.record_first_audio_latency_ms(
                        self.session_id,
                        turn_id,
                        duration_to_ms(latency),
                    );
                }
                (Stage::Audio, None)
            }
            OutputEventKind::AudioPlaybackEnded { reason } => (Stage::Audio, Some(*reason)),
            OutputEventKind::Error { .. } => {
                timings.reason = CompletionReason::Error;
                return;
            }
        };

        let Some(timer) = timings.timer(stage) else {
            return;
        };
        timer.start(at);
        if let Some(reason) = ended {
            if let Some(elapsed) = timer.stop(at) {
                timings.reason = timings.reason.worst(reason);
                self.metrics.record_stage_duration_ms(
                    self.session_id,
                    Some(turn_id),
                    stage,
                    duration_to_ms(elapsed),
                    reason,
                );
            }
        }
    }

    /// Close the turn's timings, recording the whole-turn duration.
    ///
    /// Stages still running are stopped and recorded with `reason`. The overall
    /// outcome is the most severe of `reason` and every stage outcome seen.
    /// Returns `None` if the turn was not being tracked.
    pub fn finish_turn(
        &mut self,
        turn_id: TurnId,
        reason: CompletionReason,
        at: Instant,
    ) -> Option<TurnTimingSummary> {
        let mut timings = self.turns.remove(&turn_id)?;
        let overall = timings.reason.worst(reason);

        for stage in [Stage::Llm, Stage::Tts, Stage::Audio] {
            let Some(timer) = timings.timer(stage) else {
                continue;
            };
            if timer.is_running() {
                if let Some(elapsed) = timer.stop(at) {
                    self.metrics.record_stage_duration_ms(
                        self.session_id,
                        Some(turn_id),
                        stage,
                        duration_to_ms(elapsed),
                        reason,
                    );
                }
            }
        }

        let total = at.saturating_duration_since(timings.started);
        self.metrics
            .record_turn_duration_ms(self.session_id, turn_id, duration_to_ms(total), overall);

        Some(TurnTimingSummary {
            turn_id,
            llm: timings.llm.elapsed(),
            tts: timings.tts.elapsed(),
            audio: timings.audio.elapsed(),
            first_audio: timings.first_audio,
            total,
            reason: overall,
        })
    }
}
