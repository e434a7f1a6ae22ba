//! Session database dumps.
//!
//! `pg_dump` output is zstd-compressed into the work directory, uploaded as
//! `<role>-<name>-db-backup_<instant>.sql.zst` and rotated with the archive
//! retention counts.

use crate::config::{DbConfig, RetentionConfig};
use crate::fs::{self as efs, RunLock};
use crate::rotation;
use crate::storage::ObjectStore;
use crate::sweeper::{check_clock, MIN_DAILY_COUNT};
use crate::utils::errors::{EngineError, Result};
use crate::utils::format::{format_bytes, format_duration};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info};

const DUMP_SUFFIX: &str = ".sql.zst";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
/// Bytes of pg_dump stderr kept for the error message.
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone)]
pub struct DbBackupSettings {
    pub role: String,
    pub work_dir: PathBuf,
    pub db: DbConfig,
    pub retention: RetentionConfig,
    pub offset: FixedOffset,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbBackupReport {
    pub key: String,
    pub dump_bytes: u64,
    pub compressed_bytes: u64,
    pub deleted_dumps: Vec<String>,
    pub duration_ms: u64,
}

pub struct DbBackup {
    settings: DbBackupSettings,
    store: Arc<dyn ObjectStore>,
}

impl DbBackup {
    pub fn new(settings: DbBackupSettings, store: Arc<dyn ObjectStore>) -> Self {
        Self { settings, store }
    }

    fn prefix(&self) -> String {
        format!("{}-{}-db-backup_", self.settings.role, self.settings.db.name)
    }

    pub fn run(&self) -> Result<DbBackupReport> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> Result<DbBackupReport> {
        if !self.settings.db.enabled {
            return Err(EngineError::Config("database backup is disabled".into()));
        }
        let _lock = RunLock::acquire(&self.settings.work_dir.join("db.lock"))?;
        let scratch = self.settings.work_dir.join("db");
        efs::reset_dir(&scratch)?;

        let result = self.dump_and_rotate(now, &scratch);
        if let Err(e) = efs::remove_dir_if_exists(&scratch) {
            error!("Failed to remove {}: {}", scratch.display(), e);
        }
        if let Err(e) = &result {
            error!("Database backup failed: {}", e);
        }
        result
    }

    fn dump_and_rotate(&self, now: DateTime<Utc>, scratch: &Path) -> Result<DbBackupReport> {
        let start_time = Instant::now();
        let key = format!("{}{}{}", self.prefix(), now.format(TIMESTAMP_FORMAT), DUMP_SUFFIX);
        let dump_path = scratch.join(&key);

        let dump_bytes = self.dump_to(&dump_path)?;
        let compressed_bytes = std::fs::metadata(&dump_path)?.len();
        self.store.put_file(&key, &dump_path)?;
        info!(
            "Uploaded {} ({} dump, {} compressed)",
            key,
            format_bytes(dump_bytes),
            format_bytes(compressed_bytes)
        );

        let deleted_dumps = self.rotate(now)?;
        let elapsed = start_time.elapsed();
        info!("Database backup completed in {}", format_duration(elapsed));

        Ok(DbBackupReport {
            key,
            dump_bytes,
            compressed_bytes,
            deleted_dumps,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Stream `pg_dump` stdout through a zstd encoder into `dest`.
    fn dump_to(&self, dest: &Path) -> Result<u64> {
        let db = &self.settings.db;
        let mut child = Command::new(&db.pg_dump)
            .arg(format!("--dbname={}", db.url))
            .arg("--no-owner")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Subprocess(format!("failed to start {}: {e}", db.pg_dump.display())))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Subprocess("pg_dump stdout not captured".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Subprocess("pg_dump stderr not captured".into()))?;
        // Drained concurrently so a chatty pg_dump can't block on a full pipe.
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let mut pipe = stderr_pipe;
            let _ = pipe.read_to_end(&mut buf);
            buf
        });

        let copied = std::fs::File::create(dest).map_err(EngineError::from).and_then(|file| {
            let mut encoder = zstd::stream::Encoder::new(file, db.compression_level)?;
            let n = io::copy(&mut stdout, &mut encoder)?;
            encoder.finish()?.sync_all()?;
            Ok(n)
        });
        drop(stdout);

        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        let stderr = stderr_tail(&stderr);
        let dump_bytes = copied?;

        if !status.success() {
            return Err(EngineError::Subprocess(format!(
                "{} exited with {}: {}",
                db.pg_dump.display(),
                status,
                stderr
            )));
        }
        Ok(dump_bytes)
    }

    /// Delete dumps outside the daily, monthly and recent keep-sets.
    fn rotate(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let retention = &self.settings.retention;
        let prefix = self.prefix();
        let keys: Vec<String> = self.store.list(&prefix)?.into_iter().map(|o| o.key).collect();
        let dumps = rotation::parse(&keys, &prefix, DUMP_SUFFIX);

        check_clock(
            "database dump",
            &dumps,
            now,
            Duration::days(i64::from(retention.staleness_days)),
        )?;

        let offset = &self.settings.offset;
        let daily = rotation::last_n(
            &rotation::first_of_each_day(&dumps, offset),
            retention.daily_count.max(MIN_DAILY_COUNT),
        );
        let monthly = rotation::last_n(&rotation::first_of_each_month(&dumps, offset), retention.monthly_count);
        let recent = rotation::newer_than(&dumps, now - Duration::days(i64::from(retention.incremental_days)));
        let doomed = rotation::deletion_set(&dumps, &[&daily, &monthly, &recent]);

        let mut deleted = Vec::with_capacity(doomed.len());
        for key in doomed.into_values() {
            self.store.delete(&key)?;
            info!("Deleted old database dump {}", key);
            deleted.push(key);
        }
        Ok(deleted)
    }
}

/// Last `STDERR_TAIL` bytes of stderr as text.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::LocalObjectStore;
    use crate::testutil::at;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_pg_dump(dir: &Path, body: &str) -> Result<PathBuf> {
        let path = dir.join("pg_dump");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn db_job(dir: &TempDir, pg_dump: PathBuf, retention: RetentionConfig) -> Result<(DbBackup, Arc<LocalObjectStore>)> {
        let store = Arc::new(LocalObjectStore::new(dir.path().join("bucket"))?);
        let settings = DbBackupSettings {
            role: "file-broker".into(),
            work_dir: dir.path().join("work"),
            db: DbConfig {
                enabled: true,
                url: "postgresql://localhost/sessions".into(),
                pg_dump,
                ..DbConfig::default()
            },
            retention,
            offset: FixedOffset::east_opt(0).unwrap(),
        };
        Ok((DbBackup::new(settings, store.clone()), store))
    }

    #[test]
    fn test_dump_is_compressed_and_uploaded() -> Result<()> {
        let dir = TempDir::new()?;
        let pg_dump = fake_pg_dump(dir.path(), "echo \"CREATE TABLE session ();\"")?;
        let (job, store) = db_job(&dir, pg_dump, RetentionConfig::default())?;

        let report = job.run_at(at("2024-03-01T02:00:00Z"))?;
        assert_eq!(
            report.key,
            "file-broker-session-db-db-backup_2024-03-01T02:00:00.000Z.sql.zst"
        );
        let compressed = store.get_bytes(&report.key)?;
        let dump = zstd::stream::decode_all(compressed.as_slice())?;
        assert_eq!(dump, b"CREATE TABLE session ();\n");
        assert_eq!(report.dump_bytes, dump.len() as u64);
        Ok(())
    }

    #[test]
    fn test_failing_dump_uploads_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let pg_dump = fake_pg_dump(dir.path(), "echo connection refused >&2\nexit 1")?;
        let (job, store) = db_job(&dir, pg_dump, RetentionConfig::default())?;

        let err = job.run_at(at("2024-03-01T02:00:00Z")).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(store.list("")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_verbose_stderr_does_not_stall_the_dump() -> Result<()> {
        let dir = TempDir::new()?;
        let pg_dump = fake_pg_dump(
            dir.path(),
            "head -c 262144 /dev/zero | tr '\\0' x >&2\necho dump",
        )?;
        let (job, store) = db_job(&dir, pg_dump, RetentionConfig::default())?;

        let report = job.run_at(at("2024-03-01T02:00:00Z"))?;
        let dump = zstd::stream::decode_all(store.get_bytes(&report.key)?.as_slice())?;
        assert_eq!(dump, b"dump\n");
        Ok(())
    }

    #[test]
    fn test_failure_message_keeps_the_stderr_tail() -> Result<()> {
        let dir = TempDir::new()?;
        let pg_dump = fake_pg_dump(
            dir.path(),
            "head -c 262144 /dev/zero | tr '\\0' x >&2\necho >&2\necho 'FATAL: role missing' >&2\nexit 1",
        )?;
        let (job, store) = db_job(&dir, pg_dump, RetentionConfig::default())?;

        let err = job.run_at(at("2024-03-01T02:00:00Z")).unwrap_err().to_string();
        assert!(err.ends_with("FATAL: role missing"));
        assert!(err.len() < 2 * STDERR_TAIL);
        assert!(store.list("")?.is_empty());

        // The lock was released with the failed run.
        assert!(!dir.path().join("work/db.lock").exists());
        Ok(())
    }

    #[test]
    fn test_old_dumps_are_rotated() -> Result<()> {
        let dir = TempDir::new()?;
        let pg_dump = fake_pg_dump(dir.path(), "echo dump")?;
        let retention = RetentionConfig {
            daily_count: 3,
            monthly_count: 0,
            incremental_days: 1,
            ..RetentionConfig::default()
        };
        let (job, store) = db_job(&dir, pg_dump, retention)?;

        for day in 1..=6 {
            job.run_at(at(&format!("2024-03-{day:02}T02:00:00Z")))?;
        }
        let remaining: Vec<_> = store.list("")?.into_iter().map(|o| o.key).collect();
        assert_eq!(remaining.len(), 3);
        assert!(remaining[0].contains("2024-03-04"));
        Ok(())
    }
}
