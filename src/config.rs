//! Configuration types for parley sessions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Top-level configuration shared by every session an orchestrator creates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Turn-taking behaviour.
    pub conversation: ConversationOptions,
    /// Transcript and prompt settings.
    pub context: ContextOptions,
    /// Identity of the assistant participant.
    pub assistant: AssistantConfig,
    /// Bounded waits used during teardown.
    pub timeouts: TimeoutConfig,
}

/// What to do when the user speaks while a turn is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInStrategy {
    /// Keep the current turn; user speech is dropped until the assistant finishes.
    Ignore,
    /// Cancel the current turn and start over with the new input.
    #[default]
    #[serde(alias = "interrupt")]
    InterruptAndRequeue,
}

impl BargeInStrategy {
    /// Whether user input may interrupt an in-flight turn.
    pub fn allows_interruption(self) -> bool {
        !matches!(self, Self::Ignore)
    }
}

/// Turn-taking options read once at session creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationOptions {
    pub barge_in: BargeInStrategy,
    /// Topics seeded into a new session's context.
    pub initial_topics: Vec<String>,
    /// Situation description seeded into a new session's context.
    pub initial_context: Option<String>,
}

/// Transcript and prompt configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// System prompt placed first in every generator request.
    pub system_prompt: String,
    /// Committed turns kept in history. `0` keeps everything.
    pub max_history_turns: usize,
    /// Topics always advertised to the generator.
    pub topics: Vec<String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            system_prompt: "You are a friendly voice assistant. Keep replies short and conversational."
                .to_owned(),
            max_history_turns: 100,
            topics: Vec::new(),
        }
    }
}

/// Assistant participant identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub id: String,
    pub name: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            id: "assistant".to_owned(),
            name: "Assistant".to_owned(),
        }
    }
}

/// Bounded waits applied while tearing down turns and sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Max wait for generator, synthesizer and playback tasks after a turn is cancelled.
    pub turn_cancel_ms: u64,
    /// Max wait for a session's run loop to finish during dispose/shutdown.
    pub session_shutdown_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            turn_cancel_ms: 2_000,
            session_shutdown_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn turn_cancel(&self) -> Duration {
        Duration::from_millis(self.turn_cancel_ms)
    }

    pub fn session_shutdown(&self) -> Duration {
        Duration::from_millis(self.session_shutdown_ms)
    }
}

impl ConversationConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Render the configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::paths::config_file()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConversationConfig::default();
        assert_eq!(config.conversation.barge_in, BargeInStrategy::InterruptAndRequeue);
        assert_eq!(config.context.max_history_turns, 100);
        assert_eq!(config.assistant.id, "assistant");
        assert_eq!(config.timeouts.turn_cancel(), Duration::from_secs(2));
        assert!(!config.context.system_prompt.is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ConversationConfig::default();
        config.conversation.barge_in = BargeInStrategy::Ignore;
        config.conversation.initial_topics = vec!["weather".to_owned()];
        config.assistant.name = "Wren".to_owned();
        config.timeouts.turn_cancel_ms = 250;
        config.save_to_file(&path).expect("save config");

        let loaded = ConversationConfig::from_file(&path).expect("load config");
        assert_eq!(loaded.conversation.barge_in, BargeInStrategy::Ignore);
        assert_eq!(loaded.conversation.initial_topics, vec!["weather"]);
        assert_eq!(loaded.assistant.name, "Wren");
        assert_eq!(loaded.timeouts.turn_cancel_ms, 250);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result =
            ConversationConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(SessionError::Io(_))));
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").expect("write file");

        let result = ConversationConfig::from_file(&path);
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: ConversationConfig = toml::from_str(
            r#"
            [conversation]
            barge_in = "interrupt"
            "#,
        )
        .expect("parse partial config");
        assert_eq!(config.conversation.barge_in, BargeInStrategy::InterruptAndRequeue);
        assert_eq!(config.context.max_history_turns, 100);
        assert_eq!(config.timeouts.session_shutdown_ms, 5_000);
    }

    #[test]
    fn barge_in_strategy_parses_snake_case() {
        let config: ConversationConfig = toml::from_str(
            r#"
            [conversation]
            barge_in = "ignore"
            "#,
        )
        .expect("parse config");
        assert!(!config.conversation.barge_in.allows_interruption());
        assert!(BargeInStrategy::InterruptAndRequeue.allows_interruption());
    }

    #[test]
    fn config_serializes_to_toml() {
        let toml_str = ConversationConfig::default().to_toml().expect("serialize");
        assert!(toml_str.contains("barge_in = \"interrupt_and_requeue\""));
        assert!(toml_str.contains("turn_cancel_ms"));
    }
}
