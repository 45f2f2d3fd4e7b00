//! Identifiers and small value types shared across the conversation core.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one user-input → assistant-response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a participant is in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Human,
    Assistant,
}

/// A speaker known to the conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub role: ParticipantRole,
}

impl ParticipantInfo {
    pub fn human(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: ParticipantRole::Human,
        }
    }

    pub fn assistant(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: ParticipantRole::Assistant,
        }
    }
}

/// How a stream, playback or whole turn finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    #[default]
    Completed,
    Cancelled,
    Error,
}

impl CompletionReason {
    /// Combine two outcomes, keeping the more severe one (`Error` > `Cancelled` > `Completed`).
    pub fn worst(self, other: Self) -> Self {
        fn rank(reason: CompletionReason) -> u8 {
            match reason {
                CompletionReason::Completed => 0,
                CompletionReason::Cancelled => 1,
                CompletionReason::Error => 2,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_ne!(TurnId::new(), TurnId::new());
    }

    #[test]
    fn worst_prefers_error_then_cancelled() {
        use CompletionReason::*;
        assert_eq!(Completed.worst(Cancelled), Cancelled);
        assert_eq!(Cancelled.worst(Completed), Cancelled);
        assert_eq!(Cancelled.worst(Error), Error);
        assert_eq!(Error.worst(Completed), Error);
        assert_eq!(Completed.worst(Completed), Completed);
    }

    #[test]
    fn participant_constructors_set_role() {
        assert_eq!(ParticipantInfo::human("u", "User").role, ParticipantRole::Human);
        assert_eq!(
            ParticipantInfo::assistant("a", "Assistant").role,
            ParticipantRole::Assistant
        );
    }
}
