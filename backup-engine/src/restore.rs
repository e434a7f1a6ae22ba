//! Restore of a local archive generation into a target directory.

use crate::capability::Encryptor;
use crate::fs as efs;
use crate::generation::{GenerationLayout, ARCHIVE_INFO};
use crate::manifest::Manifest;
use crate::rotation;
use crate::utils::errors::{EngineError, Result};
use crate::utils::format::format_bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub generation: String,
    pub restored_files: usize,
    pub restored_bytes: u64,
    pub failed_files: Vec<String>,
}

pub struct Restorer {
    archive_root: PathBuf,
    layout: GenerationLayout,
    encryptor: Arc<dyn Encryptor>,
}

impl Restorer {
    pub fn new(archive_root: PathBuf, layout: GenerationLayout, encryptor: Arc<dyn Encryptor>) -> Self {
        Self {
            archive_root,
            layout,
            encryptor,
        }
    }

    /// Newest archive directory that carries its sentinel.
    pub fn latest_archive(&self) -> Result<Option<String>> {
        if !self.archive_root.exists() {
            return Ok(None);
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.archive_root)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if entry.path().join(ARCHIVE_INFO).is_file() {
                    names.push(name);
                }
            }
        }
        let timeline = rotation::parse(
            names.iter().filter(|n| n.starts_with(self.layout.prefix())),
            self.layout.prefix(),
            "",
        );
        Ok(timeline.into_values().next_back())
    }

    /// Decrypt every file of `generation` (newest when `None`) below `target`.
    ///
    /// A file that fails to decrypt or comes out with the wrong size is
    /// reported and the restore continues.
    pub fn restore(&self, generation: Option<&str>, target: &Path) -> Result<RestoreReport> {
        let generation = match generation {
            Some(name) => name.to_string(),
            None => self
                .latest_archive()?
                .ok_or_else(|| EngineError::Storage(format!("no archive below {}", self.archive_root.display())))?,
        };
        let archive_dir = efs::contained_path(&generation)
            .filter(|relative| relative.components().count() == 1)
            .map(|relative| self.archive_root.join(relative))
            .ok_or_else(|| EngineError::Config(format!("invalid generation name '{generation}'")))?;
        let manifest = Manifest::read_from(&archive_dir.join(ARCHIVE_INFO))?;
        info!(generation = %generation, "Restoring {} files into {}", manifest.len(), target.display());

        std::fs::create_dir_all(target)?;
        let mut report = RestoreReport {
            generation: generation.clone(),
            restored_files: 0,
            restored_bytes: 0,
            failed_files: Vec::new(),
        };

        for entry in manifest.entries() {
            let (Some(encrypted), Some(plain)) = (
                efs::contained_path(&entry.encrypted_path),
                efs::contained_path(&entry.path),
            ) else {
                warn!(path = %entry.path, "Skipping entry with unsafe path");
                report.failed_files.push(entry.path.clone());
                continue;
            };

            let dest = target.join(plain);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let Err(e) = self.encryptor.decrypt(&archive_dir.join(encrypted), &dest) {
                warn!(path = %entry.path, "Failed to decrypt: {}", e);
                report.failed_files.push(entry.path.clone());
                continue;
            }

            match efs::file_size(&dest)? {
                Some(size) if size == entry.plaintext_size => {
                    report.restored_files += 1;
                    report.restored_bytes += size;
                }
                size => {
                    warn!(
                        path = %entry.path,
                        "Restored size {:?} differs from recorded {}",
                        size,
                        entry.plaintext_size
                    );
                    report.failed_files.push(entry.path.clone());
                }
            }
        }

        info!(
            generation = %generation,
            "Restore completed: {} files ({}), {} failed",
            report.restored_files,
            format_bytes(report.restored_bytes),
            report.failed_files.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, Fixture, HeaderEncryptor};
    use tempfile::TempDir;

    fn restorer(fx: &Fixture) -> Restorer {
        Restorer::new(fx.archive_root().to_path_buf(), fx.layout(), Arc::new(HeaderEncryptor))
    }

    #[test]
    fn test_restore_latest_archive_reproduces_tree() -> Result<()> {
        let fx = Fixture::new()?;
        fx.write_file("a", 10)?;
        fx.write_file("dir/b", 40)?;
        fx.producer().run_at(at("2024-03-01T02:00:00Z"))?;
        fx.consolidator().run()?;
        fx.write_file("dir/c", 100)?;
        let latest = fx.producer().run_at(at("2024-03-02T02:00:00Z"))?;
        fx.consolidator().run()?;

        let target = TempDir::new()?;
        let report = restorer(&fx).restore(None, target.path())?;
        assert_eq!(report.generation, latest.generation);
        assert_eq!(report.restored_files, 3);
        assert!(report.failed_files.is_empty());
        for file in ["a", "dir/b", "dir/c"] {
            assert_eq!(
                std::fs::read(target.path().join(file))?,
                std::fs::read(fx.storage_root().join(file))?
            );
        }
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_reported() -> Result<()> {
        let fx = Fixture::new()?;
        fx.write_file("a", 10)?;
        let backup = fx.producer().run_at(at("2024-03-01T02:00:00Z"))?;
        fx.consolidator().run()?;
        std::fs::write(fx.archive_root().join(&backup.generation).join("a.enc"), b"garbage")?;

        let target = TempDir::new()?;
        let report = restorer(&fx).restore(Some(&backup.generation), target.path())?;
        assert_eq!(report.failed_files, vec!["a".to_string()]);
        Ok(())
    }

    #[test]
    fn test_no_archive_is_an_error() -> Result<()> {
        let fx = Fixture::new()?;
        let target = TempDir::new()?;
        assert!(restorer(&fx).restore(None, target.path()).is_err());
        assert!(restorer(&fx).restore(Some("../escape"), target.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_nested_generation_name_is_rejected() -> Result<()> {
        let fx = Fixture::new()?;
        fx.write_file("a", 10)?;
        let backup = fx.producer().run()?;
        fx.consolidator().run()?;
        // A copy of the manifest one level down must not be reachable by name.
        let nested = fx.archive_root().join(&backup.generation).join("nested");
        std::fs::create_dir_all(&nested)?;
        std::fs::copy(
            fx.archive_root().join(&backup.generation).join(ARCHIVE_INFO),
            nested.join(ARCHIVE_INFO),
        )?;

        let target = TempDir::new()?;
        let name = format!("{}/nested", backup.generation);
        assert!(matches!(
            restorer(&fx).restore(Some(&name), target.path()),
            Err(EngineError::Config(_))
        ));
        assert!(restorer(&fx).restore(Some(&backup.generation), target.path()).is_ok());
        Ok(())
    }
}
