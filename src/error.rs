//! Error types for parley sessions.
//!
//! Each variant carries a stable code accessible via [`SessionError::code()`].

use crate::conversation::state_machine::{ConversationState, Trigger};

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Input or output adapter failed to initialize, start, stop or dispose.
    pub const ADAPTER_FAILED: &str = "ADAPTER_FAILED";

    /// Text generator failed mid-stream.
    pub const GENERATOR_FAILED: &str = "GENERATOR_FAILED";

    /// Speech synthesizer failed mid-stream.
    pub const SYNTHESIZER_FAILED: &str = "SYNTHESIZER_FAILED";

    /// Audio output failed during playback.
    pub const PLAYBACK_FAILED: &str = "PLAYBACK_FAILED";

    /// Conversation context rejected an operation.
    pub const CONTEXT_INVALID: &str = "CONTEXT_INVALID";

    /// A trigger has no rule in the current state.
    pub const UNHANDLED_TRIGGER: &str = "UNHANDLED_TRIGGER";

    /// Session registry rejected an operation.
    pub const REGISTRY_ERROR: &str = "REGISTRY_ERROR";

    /// Invalid or unreadable configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Channel send/receive failure.
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";

    /// Turn pipeline coordination failure.
    pub const PIPELINE_ERROR: &str = "PIPELINE_ERROR";

    /// Session `run` was called more than once.
    pub const ALREADY_RUNNING: &str = "ALREADY_RUNNING";

    /// Operation on a session that has already been disposed.
    pub const DISPOSED: &str = "DISPOSED";

    /// Filesystem I/O failure.
    pub const IO_ERROR: &str = "IO_ERROR";
}

/// Top-level error type for conversation sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Input or output adapter error.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Text generation error.
    #[error("generator error: {0}")]
    Generator(String),

    /// Speech synthesis error.
    #[error("synthesizer error: {0}")]
    Synthesizer(String),

    /// Audio playback error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Conversation context error (unknown participant, no active turn).
    #[error("context error: {0}")]
    Context(String),

    /// Trigger fired in a state that has no rule for it.
    #[error("trigger {trigger:?} is not valid in state {state:?}")]
    UnhandledTrigger {
        state: ConversationState,
        trigger: Trigger,
    },

    /// Session registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// The session is already running.
    #[error("session is already running")]
    AlreadyRunning,

    /// The session has been disposed.
    #[error("session has been disposed")]
    Disposed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Adapter(_) => error_codes::ADAPTER_FAILED,
            Self::Generator(_) => error_codes::GENERATOR_FAILED,
            Self::Synthesizer(_) => error_codes::SYNTHESIZER_FAILED,
            Self::Playback(_) => error_codes::PLAYBACK_FAILED,
            Self::Context(_) => error_codes::CONTEXT_INVALID,
            Self::UnhandledTrigger { .. } => error_codes::UNHANDLED_TRIGGER,
            Self::Registry(_) => error_codes::REGISTRY_ERROR,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Channel(_) => error_codes::CHANNEL_CLOSED,
            Self::Pipeline(_) => error_codes::PIPELINE_ERROR,
            Self::AlreadyRunning => error_codes::ALREADY_RUNNING,
            Self::Disposed => error_codes::DISPOSED,
            Self::Io(_) => error_codes::IO_ERROR,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn unhandled_trigger_display_names_state_and_trigger() {
        let err = SessionError::UnhandledTrigger {
            state: ConversationState::Idle,
            trigger: Trigger::LlmStreamStarted,
        };
        assert_eq!(
            err.to_string(),
            "trigger LlmStreamStarted is not valid in state Idle"
        );
        assert_eq!(err.code(), error_codes::UNHANDLED_TRIGGER);
    }

    #[test]
    fn io_errors_convert_with_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SessionError = io.into();
        assert_eq!(err.code(), error_codes::IO_ERROR);
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            SessionError::Adapter(String::new()),
            SessionError::Generator(String::new()),
            SessionError::Synthesizer(String::new()),
            SessionError::Playback(String::new()),
            SessionError::Context(String::new()),
            SessionError::Registry(String::new()),
            SessionError::Config(String::new()),
            SessionError::Channel(String::new()),
            SessionError::Pipeline(String::new()),
            SessionError::AlreadyRunning,
            SessionError::Disposed,
        ];
        let mut codes: Vec<_> = errors.iter().map(SessionError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
