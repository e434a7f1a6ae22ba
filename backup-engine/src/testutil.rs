//! Shared fixtures for engine tests.

use crate::capability::{Archiver, Encryptor, NativeTar};
use crate::config::{PackagingConfig, RetentionConfig};
use crate::consolidator::{Consolidator, ConsolidatorSettings};
use crate::generation::{GenerationLayout, GenerationState, ARCHIVE_INFO, BACKUP_INFO};
use crate::manifest::Manifest;
use crate::producer::{Producer, ProducerSettings};
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::sweeper::{Sweeper, SweeperSettings};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, FixedOffset, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const ROLE: &str = "file-broker";

const HEADER: &[u8; 16] = b"TEST-ENCRYPTED!!";

pub(crate) fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Prepends a fixed header, so encrypted and plaintext sizes differ.
pub(crate) struct HeaderEncryptor;

impl Encryptor for HeaderEncryptor {
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()> {
        let mut data = HEADER.to_vec();
        data.extend(std::fs::read(input)?);
        std::fs::write(output, data)?;
        Ok(())
    }

    fn decrypt(&self, input: &Path, output: &Path) -> Result<()> {
        let data = std::fs::read(input)?;
        let plain = data
            .strip_prefix(HEADER.as_slice())
            .ok_or_else(|| EngineError::Subprocess("missing header".into()))?;
        std::fs::write(output, plain)?;
        Ok(())
    }

    fn suffix(&self) -> &str {
        ".enc"
    }
}

pub(crate) struct FailingEncryptor;

impl Encryptor for FailingEncryptor {
    fn encrypt(&self, _input: &Path, _output: &Path) -> Result<()> {
        Err(EngineError::Subprocess("encryption failed".into()))
    }

    fn decrypt(&self, _input: &Path, _output: &Path) -> Result<()> {
        Err(EngineError::Subprocess("decryption failed".into()))
    }

    fn suffix(&self) -> &str {
        ".enc"
    }
}

/// Storage root, work dir, archive root and bucket in one temp directory.
///
/// Packaging thresholds are scaled down: small < 16 B, medium < 64 B.
pub(crate) struct Fixture {
    _dir: TempDir,
    storage_root: PathBuf,
    work_dir: PathBuf,
    archive_root: PathBuf,
    retention: RetentionConfig,
    pub store: Arc<LocalObjectStore>,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Self::build(RetentionConfig::default(), false)
    }

    pub fn with_retention(retention: RetentionConfig) -> Result<Self> {
        Self::build(retention, false)
    }

    pub fn with_work_dir_inside_storage() -> Result<Self> {
        Self::build(RetentionConfig::default(), true)
    }

    fn build(retention: RetentionConfig, nested_work_dir: bool) -> Result<Self> {
        let dir = TempDir::new()?;
        let storage_root = dir.path().join("storage");
        std::fs::create_dir_all(&storage_root)?;
        let work_dir = if nested_work_dir {
            storage_root.join(".backup-work")
        } else {
            dir.path().join("work")
        };
        let archive_root = dir.path().join("archive");
        let store = Arc::new(LocalObjectStore::new(dir.path().join("bucket"))?);

        Ok(Self {
            _dir: dir,
            storage_root,
            work_dir,
            archive_root,
            retention,
            store,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn layout(&self) -> GenerationLayout {
        GenerationLayout::for_role(ROLE)
    }

    pub fn dyn_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Write `size` bytes below the storage root.
    pub fn write_file(&self, relative: &str, size: usize) -> Result<()> {
        let path = self.storage_root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data: Vec<u8> = (0..size).map(|i| b'a' + (i % 26) as u8).collect();
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn producer(&self) -> Producer {
        self.producer_with_encryptor(Arc::new(HeaderEncryptor))
    }

    pub fn producer_with_encryptor(&self, encryptor: Arc<dyn Encryptor>) -> Producer {
        let archiver: Arc<dyn Archiver> = Arc::new(NativeTar);
        Producer::new(
            ProducerSettings {
                storage_root: self.storage_root.clone(),
                work_dir: self.work_dir.clone(),
                exclude_dirs: vec![self.archive_root.clone()],
                layout: self.layout(),
                packaging: PackagingConfig {
                    small_max_bytes: 16,
                    medium_max_bytes: 64,
                },
            },
            self.dyn_store(),
            archiver,
            encryptor,
        )
    }

    pub fn consolidator(&self) -> Consolidator {
        Consolidator::new(
            ConsolidatorSettings {
                archive_root: self.archive_root.clone(),
                work_dir: self.work_dir.clone(),
                layout: self.layout(),
            },
            self.dyn_store(),
            Arc::new(NativeTar),
        )
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            SweeperSettings {
                archive_root: self.archive_root.clone(),
                work_dir: self.work_dir.clone(),
                layout: self.layout(),
                retention: self.retention.clone(),
                offset: FixedOffset::east_opt(0).unwrap(),
            },
            self.dyn_store(),
        )
    }

    pub fn raw_manifest(&self, generation: &str) -> Result<Manifest> {
        let data = self.store.get_bytes(&self.layout().sentinel_key(generation, BACKUP_INFO))?;
        Ok(Manifest::parse(&data))
    }

    pub fn archive_manifest(&self, generation: &str) -> Result<Manifest> {
        let data = self.store.get_bytes(&self.layout().sentinel_key(generation, ARCHIVE_INFO))?;
        Ok(Manifest::parse(&data))
    }

    /// Object names of `generation`, relative to it and sorted.
    pub fn object_names(&self, generation: &str) -> Result<Vec<String>> {
        let prefix = format!("{generation}/");
        Ok(self
            .store
            .list(&prefix)?
            .into_iter()
            .filter_map(|o| o.key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn generation_state(&self, generation: &str) -> Result<Option<GenerationState>> {
        let objects = self.store.list(self.layout().prefix())?;
        let generations = self
            .layout()
            .generations(objects.iter().map(|o| (o.key.as_str(), o.size)));
        Ok(generations.get(generation).map(|g| g.state))
    }
}
