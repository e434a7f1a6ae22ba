//! Archive consolidator - turns the newest raw generation into a
//! self-sufficient archive generation on local disk.
//!
//! New files come from the generation's packages, inherited files from the
//! archive directory of the generation that holds them. Inherited files are
//! hard-linked so every archive directory keeps all of its own bytes and can be
//! swept independently.

use crate::capability::Archiver;
use crate::fs::{self as efs, place, RunLock};
use crate::generation::{GenerationLayout, ARCHIVE_INFO, BACKUP_INFO, PACKAGE_EXTENSION};
use crate::manifest::{Manifest, ManifestEntry};
use crate::storage::ObjectStore;
use crate::utils::errors::Result;
use crate::utils::format::{format_bytes, format_duration};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ConsolidatorSettings {
    pub archive_root: PathBuf,
    pub work_dir: PathBuf,
    pub layout: GenerationLayout,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub generation: String,
    pub new_entries: usize,
    pub inherited_entries: usize,
    pub skipped_entries: usize,
    /// Entries whose destination was already in place from an earlier attempt
    pub resumed_entries: usize,
    pub archived_bytes: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// No raw generation in the bucket
    NothingToDo,
    AlreadyArchived { generation: String },
    Archived(ConsolidationReport),
}

enum Resolved {
    Placed,
    AlreadyPlaced,
    Skipped,
}

pub struct Consolidator {
    settings: ConsolidatorSettings,
    store: Arc<dyn ObjectStore>,
    archiver: Arc<dyn Archiver>,
}

impl Consolidator {
    pub fn new(settings: ConsolidatorSettings, store: Arc<dyn ObjectStore>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            settings,
            store,
            archiver,
        }
    }

    fn working_dir(&self) -> PathBuf {
        self.settings.work_dir.join("consolidator")
    }

    /// Lock shared with the sweeper: both write below the archive root.
    pub(crate) fn lock_path(work_dir: &Path) -> PathBuf {
        work_dir.join("archive.lock")
    }

    pub fn run(&self) -> Result<ConsolidationOutcome> {
        let _lock = RunLock::acquire(&Self::lock_path(&self.settings.work_dir))?;
        let layout = &self.settings.layout;

        let keys: Vec<String> = self
            .store
            .list(layout.prefix())?
            .into_iter()
            .map(|o| o.key)
            .collect();

        let Some(generation) = layout.latest_with_sentinel(keys.iter().map(String::as_str), BACKUP_INFO) else {
            info!("No raw generation to consolidate");
            return Ok(ConsolidationOutcome::NothingToDo);
        };

        let archive_key = layout.sentinel_key(&generation, ARCHIVE_INFO);
        if keys.iter().any(|k| *k == archive_key) {
            info!(generation = %generation, "Already archived, nothing to do");
            return Ok(ConsolidationOutcome::AlreadyArchived { generation });
        }

        let working = self.working_dir();
        efs::reset_dir(&working)?;
        let result = self.consolidate(&generation, &keys, &working);

        if let Err(e) = efs::remove_dir_if_exists(&working) {
            warn!("Failed to remove working directory {}: {}", working.display(), e);
        }
        match result {
            Ok(report) => Ok(ConsolidationOutcome::Archived(report)),
            Err(e) => {
                error!(generation = %generation, "Consolidation failed, no sentinel written: {}", e);
                Err(e)
            }
        }
    }

    fn consolidate(&self, generation: &str, keys: &[String], working: &Path) -> Result<ConsolidationReport> {
        let start_time = Instant::now();
        let layout = &self.settings.layout;
        info!(generation = %generation, "Starting consolidation");

        let manifest = Manifest::parse(&self.store.get_bytes(&layout.sentinel_key(generation, BACKUP_INFO))?);
        let files_dir = working.join("files");
        self.download_packages(generation, keys, working, &files_dir)?;

        let archive_dir = self.settings.archive_root.join(generation);
        let mut archived = Manifest::new();
        let mut report = ConsolidationReport {
            generation: generation.to_string(),
            new_entries: 0,
            inherited_entries: 0,
            skipped_entries: 0,
            resumed_entries: 0,
            archived_bytes: 0,
            duration_ms: 0,
        };

        for entry in manifest.entries() {
            let is_new = entry.source_generation == generation;
            match self.resolve(entry, is_new, &files_dir, &archive_dir) {
                Resolved::Skipped => {
                    report.skipped_entries += 1;
                    continue;
                }
                Resolved::AlreadyPlaced => report.resumed_entries += 1,
                Resolved::Placed => {}
            }
            if is_new {
                report.new_entries += 1;
            } else {
                report.inherited_entries += 1;
            }
            report.archived_bytes += entry.encrypted_size;
            archived.push(entry.relocated(generation));
        }

        // Commit point: local copy first, then the bucket sentinel
        let local_sentinel = archive_dir.join(ARCHIVE_INFO);
        archived.write_to(&local_sentinel)?;
        self.store
            .put_file(&layout.sentinel_key(generation, ARCHIVE_INFO), &local_sentinel)?;

        let elapsed = start_time.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        info!(
            generation = %generation,
            "Consolidation completed: {} new, {} inherited, {} skipped, {} archived, took {}",
            report.new_entries,
            report.inherited_entries,
            report.skipped_entries,
            format_bytes(report.archived_bytes),
            format_duration(elapsed)
        );
        Ok(report)
    }

    /// Download every package of `generation` and unpack it into `files_dir`.
    fn download_packages(&self, generation: &str, keys: &[String], working: &Path, files_dir: &Path) -> Result<()> {
        let packages_dir = working.join("packages");
        std::fs::create_dir_all(&packages_dir)?;
        std::fs::create_dir_all(files_dir)?;

        for key in keys {
            let Some((owner, relative)) = self.settings.layout.split_key(key) else {
                continue;
            };
            if owner != generation || relative == BACKUP_INFO || relative == ARCHIVE_INFO {
                continue;
            }

            let Some(local) = efs::contained_path(relative) else {
                warn!("Ignoring object with unsafe key {}", key);
                continue;
            };
            if relative.ends_with(PACKAGE_EXTENSION) {
                let package = packages_dir.join(&local);
                self.store.get_to_file(key, &package)?;
                self.archiver.unpack(&package, files_dir)?;
                std::fs::remove_file(&package)?;
                debug!("Unpacked {}", key);
            } else {
                self.store.get_to_file(key, &files_dir.join(&local))?;
            }
        }
        Ok(())
    }

    /// Place the encrypted bytes of `entry` below `archive_dir`.
    fn resolve(&self, entry: &ManifestEntry, is_new: bool, files_dir: &Path, archive_dir: &Path) -> Resolved {
        let (Some(relative), Some(source_dir)) = (
            efs::contained_path(&entry.encrypted_path),
            efs::contained_path(&entry.source_generation),
        ) else {
            warn!(path = %entry.path, "Skipping entry with unsafe encrypted path or generation");
            return Resolved::Skipped;
        };

        let dest = archive_dir.join(&relative);
        if matches!(efs::file_size(&dest), Ok(Some(size)) if size == entry.encrypted_size) {
            return Resolved::AlreadyPlaced;
        }

        let src = if is_new {
            files_dir.join(&relative)
        } else {
            self.settings.archive_root.join(source_dir).join(&relative)
        };
        match efs::file_size(&src) {
            Ok(Some(size)) if size == entry.encrypted_size => {}
            Ok(Some(size)) => {
                warn!(
                    path = %entry.path,
                    "Size mismatch for {}: expected {} bytes, found {}, skipping",
                    src.display(),
                    entry.encrypted_size,
                    size
                );
                return Resolved::Skipped;
            }
            Ok(None) => {
                warn!(path = %entry.path, "Missing {}, skipping", src.display());
                return Resolved::Skipped;
            }
            Err(e) => {
                warn!(path = %entry.path, "Cannot stat {}: {}, skipping", src.display(), e);
                return Resolved::Skipped;
            }
        }

        let placed = if is_new {
            place::move_into(&src, &dest)
        } else {
            place::link_into(&src, &dest)
        };
        match placed {
            Ok(placement) => {
                debug!("Placed {} ({:?})", dest.display(), placement);
                Resolved::Placed
            }
            Err(e) => {
                warn!(path = %entry.path, "Failed to place {}: {}, skipping", dest.display(), e);
                Resolved::Skipped
            }
        }
    }
}
