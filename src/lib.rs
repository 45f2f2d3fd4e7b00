//! Parley: turn orchestration for real-time spoken conversations.
//!
//! A session listens to speech-recognition input, asks a streaming generator
//! for a reply, synthesizes it and plays it back, while letting the user cut
//! in at any moment:
//! Recognizer → Session → Generator → Synthesizer → Output
//!
//! # Architecture
//!
//! - **State machine**: a pure transition table ([`conversation::state_machine`])
//!   evaluated by a serialized dispatcher, one fire at a time
//! - **Turn pipeline**: each turn owns a cancellation scope and two chunk
//!   channels, generator text to the synthesizer and audio to the output
//! - **Barge-in**: new input during a reply interrupts it (or is ignored,
//!   depending on the configured strategy) and is re-queued for processing
//! - **Orchestrator**: runs many sessions under one cancellation tree
//!
//! Speech recognition, generation, synthesis and playback are supplied
//! through the traits in [`adapters`].

pub mod adapters;
pub mod config;
pub mod conversation;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod pipeline;
pub mod runtime;

pub use config::{BargeInStrategy, ConversationConfig};
pub use conversation::{
    ConversationOrchestrator, ConversationSession, ConversationState, ParticipantInfo, SessionId,
    Trigger, TurnId,
};
pub use error::{Result, SessionError};
pub use runtime::RuntimeEvent;
