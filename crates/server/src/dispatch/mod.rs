//! Event dispatch
//!
//! Wire event vocabulary, the per-connection phase machine, and the axum
//! WebSocket transport.

pub mod connection;
pub mod events;
pub mod handler;

pub use connection::{ConnectionPhase, PhaseTracker};
pub use events::{ChatMessageEvent, ClientEvent, ServerEvent};
pub use handler::{cleanup_session, ws_handler};
