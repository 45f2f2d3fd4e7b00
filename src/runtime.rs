//! Runtime events emitted by sessions for UI and observability.
//!
//! Intentionally lightweight so the dispatcher can publish without blocking;
//! slow subscribers lag and miss events rather than stall a session.

use chrono::{DateTime, Utc};

use crate::conversation::state_machine::{ConversationState, Trigger};
use crate::conversation::types::{SessionId, TurnId};
use crate::pipeline::latency::TurnTimingSummary;

/// A state change (or re-entry) performed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub session_id: SessionId,
    pub from: ConversationState,
    pub to: ConversationState,
    pub trigger: Trigger,
    /// Turn that was active when the trigger fired.
    pub turn_id: Option<TurnId>,
    pub at: DateTime<Utc>,
}

/// Events that describe what a session is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The state machine moved between states.
    Transition(TransitionRecord),
    /// User input arrived mid-turn and the barge-in strategy kept the turn.
    BargeInIgnored {
        session_id: SessionId,
        state: ConversationState,
        trigger: Trigger,
    },
    /// A turn finished, successfully or not.
    TurnFinished {
        session_id: SessionId,
        summary: TurnTimingSummary,
    },
    /// The session reached `Ended` and released its adapters.
    SessionEnded { session_id: SessionId },
}

impl RuntimeEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Transition(record) => record.session_id,
            Self::BargeInIgnored { session_id, .. }
            | Self::TurnFinished { session_id, .. }
            | Self::SessionEnded { session_id } => *session_id,
        }
    }
}
