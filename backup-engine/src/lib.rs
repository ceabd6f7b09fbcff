//! Backup Engine Library
//!
//! Safety-gated backup and restore orchestration for the world directory of a
//! continuously running game server controlled through a remote lifecycle API.

pub mod audit;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod fs;
pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod server;
pub mod storage;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use utils::errors::{EngineError, Result};
