//! Object storage used as the backup destination.
//!
//! Keys are `/`-separated strings. Every backend must list with full
//! pagination: callers rely on seeing every key under a prefix.

pub mod local;
pub mod retry;
pub mod s3;

use crate::config::StoreConfig;
use crate::utils::errors::Result;
use std::path::Path;
use std::sync::Arc;

pub use local::LocalObjectStore;
pub use retry::RetryConfig;
pub use s3::S3ObjectStore;

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

pub trait ObjectStore: Send + Sync {
    /// Every object whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Download an object into `dest`, replacing it if present.
    fn get_to_file(&self, key: &str, dest: &Path) -> Result<()>;

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// Upload a local file as `key`.
    fn put_file(&self, key: &str, src: &Path) -> Result<()>;

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Build the configured backend.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config {
        StoreConfig::Local { path } => Arc::new(LocalObjectStore::new(path)?),
        StoreConfig::S3 {
            bucket,
            endpoint,
            region,
            access_key,
            secret_key,
            timeout_secs,
            retry,
        } => Arc::new(S3ObjectStore::new(
            bucket,
            endpoint,
            region,
            access_key,
            secret_key,
            std::time::Duration::from_secs(*timeout_secs),
            retry.clone(),
        )?),
    };
    Ok(store)
}
