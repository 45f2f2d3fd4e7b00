//! The turn pipeline: typed events, per-turn chunk channels, the active-turn
//! scope and latency bookkeeping.

pub mod latency;
pub mod messages;
pub mod relay;
pub mod turn;
