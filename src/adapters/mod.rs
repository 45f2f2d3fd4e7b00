//! Contracts for the collaborators a session drives, plus scripted
//! implementations used by the CLI and tests.

pub mod scripted;
pub mod traits;

pub use traits::{
    ChatEngine, InputAdapter, OutputAdapter, SessionComponents, SessionFactory, TtsEngine,
};
