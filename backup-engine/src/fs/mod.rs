//! File system helpers: storage scans, run locks and crash-safe placement.

pub mod lock;
pub mod place;
pub mod walker;

pub use lock::RunLock;
pub use walker::{scan, ScanResult, WalkOptions};

use crate::utils::errors::Result;
use std::path::{Component, Path, PathBuf};

/// Remove `dir` if present and create it empty.
pub fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir_if_exists(dir)?;
    std::fs::create_dir_all(dir)?;
    Ok(())
}

pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Size of a regular file, `None` when it is missing.
pub fn file_size(path: &Path) -> Result<Option<u64>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `/`-separated relative key as a path that stays below its base directory.
pub fn contained_path(key: &str) -> Option<PathBuf> {
    let path = Path::new(key);
    let contained = !key.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    contained.then(|| path.to_path_buf())
}
