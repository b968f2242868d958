//! LiveDesk Realtime Core
//!
//! The connection, authentication, tenant-isolation, routing, and
//! presence/assignment engine behind the WebSocket transport. For every
//! inbound connection and event this crate decides who is allowed to do
//! what, which conversation it belongs to, who else must be notified, and
//! in what order.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod guard;
pub mod presence;
pub mod router;
pub mod state;
pub mod store;
pub mod tenant;

pub use config::Config;
pub use state::AppState;
