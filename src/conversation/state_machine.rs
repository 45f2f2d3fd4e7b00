//! Conversation states, triggers and the transition table.
//!
//! [`decide`] is a pure function over `(state, trigger, barge-in strategy)`.
//! The session dispatcher evaluates it for every fired trigger and runs the
//! entry, exit and internal actions attached to the result.

use serde::{Deserialize, Serialize};

use crate::config::BargeInStrategy;

/// Where a conversation session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationState {
    Initial,
    Initializing,
    Idle,
    /// Sub-state of `Idle`: the user has started speaking.
    Listening,
    ProcessingInput,
    WaitingForLlm,
    StreamingResponse,
    Speaking,
    Interrupted,
    Paused,
    Error,
    Ended,
}

impl ConversationState {
    pub const ALL: [Self; 12] = [
        Self::Initial,
        Self::Initializing,
        Self::Idle,
        Self::Listening,
        Self::ProcessingInput,
        Self::WaitingForLlm,
        Self::StreamingResponse,
        Self::Speaking,
        Self::Interrupted,
        Self::Paused,
        Self::Error,
        Self::Ended,
    ];

    /// Enclosing super-state whose rules this state inherits.
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Listening => Some(Self::Idle),
            _ => None,
        }
    }

    /// True if `self` is `other` or one of its sub-states.
    pub fn is_in(self, other: Self) -> bool {
        self == other || self.parent() == Some(other)
    }

    /// States in which a turn is being answered and barge-in applies.
    pub fn is_active_turn(self) -> bool {
        matches!(
            self,
            Self::WaitingForLlm | Self::StreamingResponse | Self::Speaking
        )
    }

    /// States in which unhandled triggers are dropped instead of raising an error.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Ended)
    }

    /// True if the table has a rule for `trigger` here. Firing a trigger
    /// without one ends a live session with an error.
    pub fn accepts(self, trigger: Trigger) -> bool {
        decide(self, trigger, BargeInStrategy::default()) != Decision::Unhandled
    }
}

/// Something that happened, to be evaluated against the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    InitializeRequested,
    InitializeComplete,
    InputDetected,
    InputFinalized,
    LlmRequestSent,
    LlmStreamStarted,
    LlmStreamChunkReceived,
    LlmStreamEnded,
    TtsRequestSent,
    TtsStreamStarted,
    TtsStreamChunkReceived,
    TtsStreamEnded,
    AudioStreamStarted,
    AudioStreamEnded,
    PauseRequested,
    ResumeRequested,
    StopRequested,
    ErrorOccurred,
}

impl Trigger {
    pub const ALL: [Self; 18] = [
        Self::InitializeRequested,
        Self::InitializeComplete,
        Self::InputDetected,
        Self::InputFinalized,
        Self::LlmRequestSent,
        Self::LlmStreamStarted,
        Self::LlmStreamChunkReceived,
        Self::LlmStreamEnded,
        Self::TtsRequestSent,
        Self::TtsStreamStarted,
        Self::TtsStreamChunkReceived,
        Self::TtsStreamEnded,
        Self::AudioStreamStarted,
        Self::AudioStreamEnded,
        Self::PauseRequested,
        Self::ResumeRequested,
        Self::StopRequested,
        Self::ErrorOccurred,
    ];

    /// User-input triggers that may barge in on an active turn.
    pub fn is_barge_in(self) -> bool {
        matches!(self, Self::InputDetected | Self::InputFinalized)
    }
}

/// Work performed without leaving the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalAction {
    /// Open the synthesizer channel and start synthesis (and playback).
    StartSynthesis,
    /// Append a generator chunk to the transcript and forward it to the synthesizer.
    RelayLlmChunk,
    /// Forward a synthesizer chunk to the output adapter.
    RelayTtsChunk,
    /// Complete the generator channel and the assistant transcript.
    EndLlmStream,
    /// Complete the synthesizer channel.
    EndTtsStream,
}

/// Result of evaluating a trigger in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the current state for another (or re-enter it).
    Transition(ConversationState),
    /// Stay put and run an internal action.
    Internal(InternalAction),
    /// Legal in this state, does nothing.
    Ignore,
    /// A barge-in trigger arrived but the strategy does not allow interruption.
    GuardRejected,
    /// No rule exists for this trigger in this state.
    Unhandled,
}

/// Evaluate `trigger` in `state`.
///
/// Sub-states consult their own rules first and fall back to their parent's.
pub fn decide(state: ConversationState, trigger: Trigger, barge_in: BargeInStrategy) -> Decision {
    if let Some(decision) = own_rule(state, trigger, barge_in) {
        return decision;
    }
    state
        .parent()
        .and_then(|parent| own_rule(parent, trigger, barge_in))
        .unwrap_or(Decision::Unhandled)
}

fn own_rule(
    state: ConversationState,
    trigger: Trigger,
    barge_in: BargeInStrategy,
) -> Option<Decision> {
    use ConversationState as S;
    use Decision::{Ignore, Internal, Transition};
    use InternalAction as A;
    use Trigger as T;

    let decision = match (state, trigger) {
        (S::Ended, _) => return None,
        (S::Error, T::StopRequested) => Transition(S::Ended),
        (S::Error, T::ErrorOccurred) => Ignore,
        (S::Error, _) => return None,

        // Every live state can be stopped or fail.
        (_, T::StopRequested) => Transition(S::Ended),
        (_, T::ErrorOccurred) => Transition(S::Error),

        (S::Initial, T::InitializeRequested) => Transition(S::Initializing),

        (S::Initializing, T::InitializeComplete) => Transition(S::Idle),

        (S::Idle, T::InputDetected) => Transition(S::Listening),
        (S::Idle, T::InputFinalized) => Transition(S::ProcessingInput),
        (S::Idle, T::PauseRequested) => Transition(S::Paused),
        (S::Idle, T::LlmStreamEnded | T::TtsStreamEnded | T::AudioStreamEnded) => Ignore,

        (S::Listening, T::InputFinalized) => Transition(S::ProcessingInput),
        (S::Listening, T::InputDetected) => Ignore,

        (S::ProcessingInput, T::LlmRequestSent) => Transition(S::WaitingForLlm),
        (S::ProcessingInput, T::LlmStreamEnded | T::TtsStreamEnded | T::AudioStreamEnded) => {
            Ignore
        }

        (S::WaitingForLlm | S::StreamingResponse | S::Speaking, t) if t.is_barge_in() => {
            if barge_in.allows_interruption() {
                Transition(S::Interrupted)
            } else {
                Decision::GuardRejected
            }
        }

        (S::WaitingForLlm, T::TtsRequestSent) => Internal(A::StartSynthesis),
        (S::WaitingForLlm, T::LlmStreamStarted) => Transition(S::StreamingResponse),
        (S::WaitingForLlm, T::TtsStreamStarted) => Ignore,

        (S::StreamingResponse | S::Speaking, T::LlmStreamChunkReceived) => {
            Internal(A::RelayLlmChunk)
        }
        (S::StreamingResponse | S::Speaking, T::TtsStreamChunkReceived) => {
            Internal(A::RelayTtsChunk)
        }
        (S::StreamingResponse | S::Speaking, T::LlmStreamEnded) => Internal(A::EndLlmStream),
        (S::StreamingResponse | S::Speaking, T::TtsStreamEnded) => Internal(A::EndTtsStream),
        (S::StreamingResponse | S::Speaking, T::TtsStreamStarted) => Ignore,
        (S::StreamingResponse, T::AudioStreamStarted) => Transition(S::Speaking),

        (S::Speaking, T::TtsRequestSent) => Internal(A::StartSynthesis),
        (S::Speaking, T::AudioStreamEnded) => Transition(S::Idle),

        (S::Interrupted, T::InputDetected) => Transition(S::Listening),
        (S::Interrupted, T::InputFinalized) => Transition(S::ProcessingInput),
        (
            S::Interrupted,
            T::LlmRequestSent
            | T::LlmStreamStarted
            | T::LlmStreamChunkReceived
            | T::LlmStreamEnded
            | T::TtsRequestSent
            | T::TtsStreamStarted
            | T::TtsStreamChunkReceived
            | T::TtsStreamEnded
            | T::AudioStreamStarted
            | T::AudioStreamEnded,
        ) => Ignore,

        (S::Paused, T::ResumeRequested) => Transition(S::Idle),
        (S::Paused, T::InputDetected | T::InputFinalized) => Ignore,

        _ => return None,
    };
    Some(decision)
}
