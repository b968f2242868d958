//! Presence and session tracking

pub mod registry;
pub mod session;

pub use registry::{AgentPresence, DeregisterOutcome, RegisterOutcome, SessionRegistry};
pub use session::ConnectionSession;
