//! Backup Engine Library
//!
//! Incremental, encrypted backups of the file-broker storage volume into an
//! object store, consolidated into self-sufficient archive generations on
//! local disk and rotated by age.

pub mod capability;
pub mod config;
pub mod consolidator;
pub mod db_backup;
pub mod engine;
pub mod fs;
pub mod generation;
pub mod manifest;
pub mod producer;
pub mod restore;
pub mod rotation;
pub mod storage;
pub mod sweeper;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use utils::errors::{EngineError, Result};
