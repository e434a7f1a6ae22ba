//! Backup producer - uploads a raw generation of the storage volume.
//!
//! A run ties together:
//! - the storage scan
//! - the diff against the latest archived manifest
//! - per-file encryption and size-tiered packaging
//! - the `BACKUP_INFO` sentinel, which is the commit point of the run
//!
//! Nothing a failed run uploaded is ever referenced: without the sentinel the
//! generation is incomplete and the next run diffs from scratch again.

pub mod packaging;

use crate::capability::{Archiver, Encryptor};
use crate::config::PackagingConfig;
use crate::fs::{self as efs, RunLock, WalkOptions};
use crate::generation::{GenerationLayout, ARCHIVE_INFO, BACKUP_INFO, PACKAGE_EXTENSION};
use crate::manifest::{Manifest, ManifestEntry};
use crate::storage::ObjectStore;
use crate::utils::errors::Result;
use crate::utils::format::{format_bytes, format_duration};
use chrono::{DateTime, Utc};
use packaging::{plan_packages, Package, PendingFile};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Producer configuration
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub storage_root: PathBuf,
    pub work_dir: PathBuf,
    /// Directories under the storage root that are never backed up
    pub exclude_dirs: Vec<PathBuf>,
    pub layout: GenerationLayout,
    pub packaging: PackagingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Backup run result
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub generation: String,
    /// Archived generation the run was diffed against
    pub base_generation: Option<String>,
    pub backup_type: BackupType,
    pub scanned_files: usize,
    pub scanned_bytes: u64,
    pub inherited_files: usize,
    pub inherited_bytes: u64,
    pub uploaded_files: usize,
    pub uploaded_bytes: u64,
    pub packages: usize,
    pub skipped_files: usize,
    pub manifest_entries: usize,
    pub duration_ms: u64,
}

/// Diff of the scan against the previous manifest
struct DiffResult {
    inherited: Vec<ManifestEntry>,
    pending: Vec<PendingFile>,
}

fn diff(scanned: &BTreeMap<String, u64>, previous: &HashMap<String, ManifestEntry>) -> DiffResult {
    let mut inherited = Vec::new();
    let mut pending = Vec::new();

    for (path, size) in scanned {
        match previous.get(path) {
            Some(entry) if entry.plaintext_size == *size => inherited.push(entry.clone()),
            _ => pending.push(PendingFile {
                path: path.clone(),
                size: *size,
            }),
        }
    }

    DiffResult { inherited, pending }
}

pub struct Producer {
    settings: ProducerSettings,
    store: Arc<dyn ObjectStore>,
    archiver: Arc<dyn Archiver>,
    encryptor: Arc<dyn Encryptor>,
}

impl Producer {
    pub fn new(
        settings: ProducerSettings,
        store: Arc<dyn ObjectStore>,
        archiver: Arc<dyn Archiver>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Self {
        Self {
            settings,
            store,
            archiver,
            encryptor,
        }
    }

    fn scratch_dir(&self) -> PathBuf {
        self.settings.work_dir.join("producer")
    }

    fn lock_path(&self) -> PathBuf {
        self.settings.work_dir.join("producer.lock")
    }

    /// Back up the storage root as a new generation named after the current time.
    pub fn run(&self) -> Result<BackupReport> {
        self.run_at(Utc::now())
    }

    /// Back up the storage root as the generation started at `now`.
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<BackupReport> {
        let _lock = RunLock::acquire(&self.lock_path())?;
        let scratch = self.scratch_dir();
        efs::reset_dir(&scratch)?;

        let result = self.run_inner(now, &scratch);

        if let Err(e) = efs::remove_dir_if_exists(&scratch) {
            warn!("Failed to remove scratch directory {}: {}", scratch.display(), e);
        }
        if let Err(e) = &result {
            error!("Backup failed, no sentinel written: {}", e);
        }
        result
    }

    fn run_inner(&self, now: DateTime<Utc>, scratch: &Path) -> Result<BackupReport> {
        let start_time = Instant::now();
        let layout = &self.settings.layout;
        let generation = layout.generation_name(now);

        info!(generation = %generation, "Starting backup of {}", self.settings.storage_root.display());

        // Latest archived generation is the diff base
        let keys: Vec<String> = self
            .store
            .list(layout.prefix())?
            .into_iter()
            .map(|o| o.key)
            .collect();
        let base_generation = layout.latest_with_sentinel(keys.iter().map(String::as_str), ARCHIVE_INFO);

        let previous = match &base_generation {
            Some(base) => {
                let data = self.store.get_bytes(&layout.sentinel_key(base, ARCHIVE_INFO))?;
                let manifest = Manifest::parse(&data);
                info!("Diffing against {} ({} entries)", base, manifest.len());
                manifest.by_path()
            }
            None => {
                info!("No archived generation found, running a full backup");
                HashMap::new()
            }
        };

        let mut exclude_dirs = self.settings.exclude_dirs.clone();
        exclude_dirs.push(self.settings.work_dir.clone());
        let scan = efs::scan(
            &self.settings.storage_root,
            &WalkOptions {
                follow_links: true,
                exclude_dirs,
            },
        )?;

        let DiffResult { inherited, pending } = diff(&scan.files, &previous);
        let inherited_files = inherited.len();
        let inherited_bytes: u64 = inherited.iter().map(|e| e.plaintext_size).sum();
        let mut manifest: Manifest = inherited.into_iter().collect();

        let packages = plan_packages(&pending, &self.settings.packaging);
        info!(
            "Scanned {} files ({}): {} unchanged, {} to back up in {} packages",
            scan.files.len(),
            format_bytes(scan.total_bytes()),
            inherited_files,
            pending.len(),
            packages.len()
        );

        let mut uploaded_files = 0;
        let mut uploaded_bytes = 0;
        let mut uploaded_packages = 0;
        for package in &packages {
            let entries = self.upload_package(&generation, package, scratch)?;
            if !entries.is_empty() {
                uploaded_packages += 1;
            }
            for entry in entries {
                uploaded_files += 1;
                uploaded_bytes += entry.plaintext_size;
                manifest.push(entry);
            }
        }

        if manifest.len() != scan.files.len() {
            warn!(
                "Manifest has {} entries but the scan found {} files; files changed during the run",
                manifest.len(),
                scan.files.len()
            );
        }

        // Commit point
        let manifest_path = scratch.join(BACKUP_INFO);
        manifest.write_to(&manifest_path)?;
        self.store
            .put_file(&layout.sentinel_key(&generation, BACKUP_INFO), &manifest_path)?;

        let elapsed = start_time.elapsed();
        info!(
            generation = %generation,
            "Backup completed: {} files uploaded ({}), {} inherited, took {}",
            uploaded_files,
            format_bytes(uploaded_bytes),
            inherited_files,
            format_duration(elapsed)
        );

        Ok(BackupReport {
            backup_type: if base_generation.is_some() {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            generation,
            base_generation,
            scanned_files: scan.files.len(),
            scanned_bytes: scan.total_bytes(),
            inherited_files,
            inherited_bytes,
            uploaded_files,
            uploaded_bytes,
            packages: uploaded_packages,
            skipped_files: scan.skipped + pending.len() - uploaded_files,
            manifest_entries: manifest.len(),
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Encrypt, pack and upload one package, returning its manifest entries.
    fn upload_package(&self, generation: &str, package: &Package, scratch: &Path) -> Result<Vec<ManifestEntry>> {
        let package_dir = scratch.join(&package.label);
        let mut members = Vec::with_capacity(package.files.len());
        let mut entries = Vec::with_capacity(package.files.len());

        for file in &package.files {
            let src = self.settings.storage_root.join(&file.path);
            let Some(plaintext_size) = efs::file_size(&src)? else {
                warn!("File disappeared before packaging, skipping: {}", file.path);
                continue;
            };

            let encrypted_path = format!("{}{}", file.path, self.encryptor.suffix());
            let dest = package_dir.join(&encrypted_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.encryptor.encrypt(&src, &dest)?;
            let encrypted_size = std::fs::metadata(&dest)?.len();

            members.push(encrypted_path.clone());
            entries.push(ManifestEntry {
                path: file.path.clone(),
                plaintext_size,
                encrypted_path,
                encrypted_size,
                source_generation: generation.to_string(),
            });
        }

        if members.is_empty() {
            efs::remove_dir_if_exists(&package_dir)?;
            return Ok(entries);
        }

        let object_name = format!("{}{}", package.label, PACKAGE_EXTENSION);
        let package_path = scratch.join(&object_name);
        self.archiver.pack(&package_dir, &members, &package_path)?;
        efs::remove_dir_if_exists(&package_dir)?;

        let package_size = std::fs::metadata(&package_path)?.len();
        self.store
            .put_file(&self.settings.layout.object_key(generation, &object_name), &package_path)?;
        std::fs::remove_file(&package_path)?;

        info!(
            "Uploaded {} ({} files, {})",
            object_name,
            members.len(),
            format_bytes(package_size)
        );
        Ok(entries)
    }
}
