//! Retention sweeper for local archive directories and bucket generations.
//!
//! Both sets are checked by the clock guard before anything is deleted: a
//! newest generation that lies in the future, or that is older than the
//! staleness bound, aborts the whole sweep.
//!
//! Archive directories that never received `ARCHIVE_INFO` and are older than
//! the newest complete archive belong to consolidations that will never be
//! resumed. They are removed as well.

use crate::config::RetentionConfig;
use crate::consolidator::Consolidator;
use crate::fs::{self as efs, RunLock};
use crate::generation::{GenerationLayout, GenerationState, ARCHIVE_INFO, BACKUP_INFO};
use crate::rotation::{self, Timeline};
use crate::storage::ObjectStore;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Daily archives are never trimmed below this count.
pub const MIN_DAILY_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    pub archive_root: PathBuf,
    pub work_dir: PathBuf,
    pub layout: GenerationLayout,
    pub retention: RetentionConfig,
    /// Offset of the calendar used for daily and monthly buckets
    pub offset: FixedOffset,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted_archives: Vec<String>,
    pub kept_archives: usize,
    pub deleted_partial_archives: Vec<String>,
    pub deleted_generations: Vec<String>,
    pub kept_generations: usize,
    pub deleted_objects: usize,
}

/// Abort when the newest item of `timeline` is in the future or stale.
pub fn check_clock<T>(label: &str, timeline: &Timeline<T>, now: DateTime<Utc>, staleness: Duration) -> Result<()> {
    let Some(newest) = timeline.keys().next_back() else {
        return Ok(());
    };
    if *newest > now {
        return Err(EngineError::ClockSanity(format!(
            "newest {label} {} is in the future (now {})",
            newest.to_rfc3339(),
            now.to_rfc3339()
        )));
    }
    if *newest < now - staleness {
        return Err(EngineError::ClockSanity(format!(
            "newest {label} {} is older than {} days (now {})",
            newest.to_rfc3339(),
            staleness.num_days(),
            now.to_rfc3339()
        )));
    }
    Ok(())
}

/// Archive directories to delete: everything outside the daily, monthly and newest keep-sets.
pub fn archive_deletions<T: Clone>(
    archives: &Timeline<T>,
    retention: &RetentionConfig,
    offset: &FixedOffset,
) -> Timeline<T> {
    let daily = rotation::last_n(
        &rotation::first_of_each_day(archives, offset),
        retention.daily_count.max(MIN_DAILY_COUNT),
    );
    let monthly = rotation::last_n(&rotation::first_of_each_month(archives, offset), retention.monthly_count);
    let newest = rotation::last_n(archives, 1);
    rotation::deletion_set(archives, &[&daily, &monthly, &newest])
}

/// Bucket generations to delete.
///
/// The raw keep-set holds the most recent `incremental_days` committed
/// generations (the `committed` subset of `generations`) and every generation
/// younger than that many days. Raw generations only make sense on top of the
/// archive they were diffed against, so the newest archived generation and
/// everything after it are kept as well. Without any archived generation
/// nothing is deleted.
pub fn generation_deletions<T: Clone>(
    generations: &Timeline<T>,
    committed: &Timeline<T>,
    newest_archived: Option<DateTime<Utc>>,
    incremental_days: u32,
    now: DateTime<Utc>,
) -> Timeline<T> {
    let Some(newest_archived) = newest_archived else {
        return Timeline::new();
    };
    let by_count = rotation::last_n(committed, incremental_days as usize);
    let by_age = rotation::newer_than(generations, now - Duration::days(i64::from(incremental_days)));
    let from_archive: Timeline<T> = generations
        .range(newest_archived..)
        .map(|(instant, item)| (*instant, item.clone()))
        .collect();
    rotation::deletion_set(generations, &[&by_count, &by_age, &from_archive])
}

pub struct Sweeper {
    settings: SweeperSettings,
    store: Arc<dyn ObjectStore>,
}

impl Sweeper {
    pub fn new(settings: SweeperSettings, store: Arc<dyn ObjectStore>) -> Self {
        Self { settings, store }
    }

    pub fn run(&self) -> Result<SweepReport> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _lock = RunLock::acquire(&Consolidator::lock_path(&self.settings.work_dir))?;
        let layout = &self.settings.layout;
        let retention = &self.settings.retention;
        let staleness = Duration::days(i64::from(retention.staleness_days));

        let (archives, partial) = self.local_archives()?;
        let objects = self.store.list(layout.prefix())?;
        let generations = layout.generations(objects.iter().map(|o| (o.key.as_str(), o.size)));
        let bucket: Timeline<String> = generations
            .values()
            .filter_map(|g| g.timestamp.map(|t| (t, g.name.clone())))
            .collect();
        let committed: Timeline<String> = generations
            .values()
            .filter(|g| g.state != GenerationState::Incomplete)
            .filter_map(|g| g.timestamp.map(|t| (t, g.name.clone())))
            .collect();

        // Nothing is deleted unless both sets pass.
        for (label, timeline) in [("archive", &archives), ("bucket generation", &bucket)] {
            if let Err(e) = check_clock(label, timeline, now, staleness) {
                error!("Sweep aborted: {}", e);
                return Err(e);
            }
        }

        let archive_doomed = archive_deletions(&archives, retention, &self.settings.offset);
        let newest_archived = generations
            .values()
            .filter(|g| g.state == GenerationState::Archived)
            .filter_map(|g| g.timestamp)
            .max();
        if newest_archived.is_none() && !bucket.is_empty() {
            warn!("No archived generation in the bucket, keeping every raw generation");
        }
        let bucket_doomed = generation_deletions(&bucket, &committed, newest_archived, retention.incremental_days, now);
        let abandoned: Vec<&String> = match archives.keys().next_back() {
            Some(newest) => partial.range(..*newest).map(|(_, name)| name).collect(),
            None => Vec::new(),
        };

        let mut report = SweepReport {
            kept_archives: archives.len() - archive_doomed.len(),
            kept_generations: bucket.len() - bucket_doomed.len(),
            ..SweepReport::default()
        };

        for name in archive_doomed.values() {
            self.delete_archive(name)?;
            report.deleted_archives.push(name.clone());
        }

        for name in abandoned {
            efs::remove_dir_if_exists(&self.settings.archive_root.join(name))?;
            info!(generation = %name, "Deleted abandoned archive directory");
            report.deleted_partial_archives.push(name.clone());
        }

        for name in bucket_doomed.values() {
            let mut keys: Vec<&str> = objects
                .iter()
                .map(|o| o.key.as_str())
                .filter(|key| matches!(layout.split_key(key), Some((g, _)) if g == name))
                .collect();
            // Sentinels go first so an interrupted delete leaves an incomplete generation.
            keys.sort_by_key(|key| !(key.ends_with(ARCHIVE_INFO) || key.ends_with(BACKUP_INFO)));
            for key in keys {
                self.store.delete(key)?;
                report.deleted_objects += 1;
            }
            info!(generation = %name, "Deleted bucket generation");
            report.deleted_generations.push(name.clone());
        }

        info!(
            "Sweep completed: {} archives deleted ({} kept), {} bucket generations deleted ({} kept)",
            report.deleted_archives.len(),
            report.kept_archives,
            report.deleted_generations.len(),
            report.kept_generations
        );
        Ok(report)
    }

    /// Archive directories below the archive root, split into complete ones
    /// and ones without `ARCHIVE_INFO`.
    fn local_archives(&self) -> Result<(Timeline<String>, Timeline<String>)> {
        let root = &self.settings.archive_root;
        if !root.exists() {
            return Ok((Timeline::new(), Timeline::new()));
        }

        let mut names = Vec::new();
        let mut partial = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(self.settings.layout.prefix()) || !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(ARCHIVE_INFO).is_file() {
                names.push(name);
            } else {
                debug!("Archive directory without {}: {}", ARCHIVE_INFO, name);
                partial.push(name);
            }
        }
        let prefix = self.settings.layout.prefix();
        Ok((rotation::parse(names, prefix, ""), rotation::parse(partial, prefix, "")))
    }

    fn delete_archive(&self, name: &str) -> Result<()> {
        let dir = self.settings.archive_root.join(name);
        // Drop the sentinel first so a half-deleted directory is not mistaken for an archive.
        match std::fs::remove_file(dir.join(ARCHIVE_INFO)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        efs::remove_dir_if_exists(&dir)?;
        info!(generation = %name, "Deleted archive directory");
        Ok(())
    }
}
