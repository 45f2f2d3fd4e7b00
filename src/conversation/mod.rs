//! Conversation sessions: state machine, transcript, session runtime and
//! the multi-session orchestrator.

pub mod context;
pub mod orchestrator;
pub mod session;
pub mod state_machine;
pub mod types;

pub use context::{ChatMessage, ChatRequest, ConversationContext, InteractionTurn};
pub use orchestrator::ConversationOrchestrator;
pub use session::{ConversationSession, FireOutcome};
pub use state_machine::{ConversationState, Trigger};
pub use types::{CompletionReason, ParticipantInfo, ParticipantRole, SessionId, TurnId};
