//! Session management: the per-turn router and the actor-per-session registry.

pub mod registry;
pub mod router;

pub use registry::{SessionCommand, SessionRegistry, TurnReply};
pub use router::Orchestrator;
