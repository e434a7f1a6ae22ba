//! Object store backed by a local directory.
//!
//! Keys map to files below the root. Used for NAS-mounted destinations and in
//! tests.

use super::{ObjectInfo, ObjectStore};
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(EngineError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }

    /// Write through a temporary sibling so readers never see partial objects.
    fn write_atomic(&self, key: &str, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".upload");
        let tmp = path.with_file_name(tmp_name);
        write(&tmp)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(".upload") || !key.starts_with(prefix) {
                continue;
            }
            objects.push(ObjectInfo {
                key,
                size: entry.metadata()?.len(),
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, dest).map_err(|e| {
            EngineError::Storage(format!("GET {key}: {e}"))
        })?;
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let src = self.path_for(key)?;
        fs::read(&src).map_err(|e| EngineError::Storage(format!("GET {key}: {e}")))
    }

    fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        self.write_atomic(key, |tmp| {
            fs::copy(src, tmp)?;
            Ok(())
        })
    }

    fn put_bytes(&self, key: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(key, |tmp| {
            fs::write(tmp, data)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Prune directories emptied by the delete, up to the root.
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}
