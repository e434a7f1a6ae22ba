//! Wiring of configuration into runnable jobs.

use crate::capability::{Archiver, CommandTar, Encryptor, GpgEncryptor, NativeTar, PassthroughEncryptor};
use crate::config::{ArchiverConfig, Config, EncryptionConfig};
use crate::consolidator::{ConsolidationOutcome, Consolidator, ConsolidatorSettings};
use crate::db_backup::{DbBackup, DbBackupReport, DbBackupSettings};
use crate::generation::{GenerationInfo, GenerationLayout};
use crate::producer::{BackupReport, Producer, ProducerSettings};
use crate::restore::{RestoreReport, Restorer};
use crate::storage::{self, ObjectStore};
use crate::sweeper::{SweepReport, Sweeper, SweeperSettings};
use crate::utils::errors::Result;
use chrono::FixedOffset;
use std::path::Path;
use std::sync::Arc;

/// Configured engine. Every operation is blocking.
pub struct Engine {
    config: Config,
    layout: GenerationLayout,
    offset: FixedOffset,
    store: Arc<dyn ObjectStore>,
    archiver: Arc<dyn Archiver>,
    encryptor: Arc<dyn Encryptor>,
}

impl Engine {
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let store = storage::from_config(&config.store)?;
        Self::with_store(config, store)
    }

    /// Engine on an already constructed store.
    pub fn with_store(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let archiver: Arc<dyn Archiver> = match &config.archiver {
            ArchiverConfig::Native => Arc::new(NativeTar),
            ArchiverConfig::Command { binary } => Arc::new(CommandTar::new(binary.clone())),
        };
        let encryptor: Arc<dyn Encryptor> = match &config.encryption {
            EncryptionConfig::Gpg {
                recipient,
                binary,
                passphrase_file,
            } => Arc::new(
                GpgEncryptor::new(binary.clone(), recipient.clone()).with_passphrase_file(passphrase_file.clone()),
            ),
            EncryptionConfig::None => Arc::new(PassthroughEncryptor),
        };

        Ok(Self {
            layout: GenerationLayout::for_role(&config.role),
            offset: config.retention.offset()?,
            config,
            store,
            archiver,
            encryptor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &GenerationLayout {
        &self.layout
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            ProducerSettings {
                storage_root: self.config.storage_root.clone(),
                work_dir: self.config.work_dir.clone(),
                exclude_dirs: vec![self.config.archive_root.clone()],
                layout: self.layout.clone(),
                packaging: self.config.packaging.clone(),
            },
            self.store.clone(),
            self.archiver.clone(),
            self.encryptor.clone(),
        )
    }

    pub fn consolidator(&self) -> Consolidator {
        Consolidator::new(
            ConsolidatorSettings {
                archive_root: self.config.archive_root.clone(),
                work_dir: self.config.work_dir.clone(),
                layout: self.layout.clone(),
            },
            self.store.clone(),
            self.archiver.clone(),
        )
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            SweeperSettings {
                archive_root: self.config.archive_root.clone(),
                work_dir: self.config.work_dir.clone(),
                layout: self.layout.clone(),
                retention: self.config.retention.clone(),
                offset: self.offset,
            },
            self.store.clone(),
        )
    }

    pub fn db_backup(&self) -> DbBackup {
        DbBackup::new(
            DbBackupSettings {
                role: self.config.role.clone(),
                work_dir: self.config.work_dir.clone(),
                db: self.config.db.clone(),
                retention: self.config.retention.clone(),
                offset: self.offset,
            },
            self.store.clone(),
        )
    }

    pub fn restorer(&self) -> Restorer {
        Restorer::new(self.config.archive_root.clone(), self.layout.clone(), self.encryptor.clone())
    }

    pub fn backup(&self) -> Result<BackupReport> {
        self.producer().run()
    }

    pub fn archive(&self) -> Result<ConsolidationOutcome> {
        self.consolidator().run()
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweeper().run()
    }

    pub fn backup_db(&self) -> Result<DbBackupReport> {
        self.db_backup().run()
    }

    pub fn restore(&self, generation: Option<&str>, target: &Path) -> Result<RestoreReport> {
        self.restorer().restore(generation, target)
    }

    /// Generations in the bucket, oldest first.
    pub fn list_generations(&self) -> Result<Vec<GenerationInfo>> {
        let objects = self.store.list(self.layout.prefix())?;
        let generations = self
            .layout
            .generations(objects.iter().map(|o| (o.key.as_str(), o.size)));
        Ok(generations.into_values().collect())
    }
}
