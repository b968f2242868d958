//! LiveDesk Shared Types and Utilities
//!
//! This crate contains types, errors, and infrastructure shared across the
//! LiveDesk platform.

pub mod cache;
pub mod db;
pub mod error;
pub mod types;

pub use cache::{MemoryCache, RedisCache, SharedCache};
pub use error::{CoreError, CoreResult};
pub use types::*;
