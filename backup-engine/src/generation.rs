//! Generation naming and object key layout.
//!
//! A generation is one timestamped run named `<role>-backup_<instant>`. All of
//! its objects live under `<generation>/` in the bucket:
//!
//! ```text
//! <generation>/BACKUP_INFO     raw manifest, written last by the producer
//! <generation>/ARCHIVE_INFO    archived manifest, written last by the consolidator
//! <generation>/<label>.tar     packages of individually encrypted files
//! ```
//!
//! The instant is rendered with a fixed width so that lexicographic order of
//! names is chronological order.

use crate::rotation;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Sentinel of a completed raw backup.
pub const BACKUP_INFO: &str = "BACKUP_INFO";
/// Sentinel of a consolidated archive.
pub const ARCHIVE_INFO: &str = "ARCHIVE_INFO";
/// Extension of package objects.
pub const PACKAGE_EXTENSION: &str = ".tar";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    /// Objects exist but the run never committed.
    Incomplete,
    /// `BACKUP_INFO` present.
    Raw,
    /// `ARCHIVE_INFO` present.
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub state: GenerationState,
    pub object_count: usize,
    pub total_bytes: u64,
}

/// Naming rules for one role's generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLayout {
    prefix: String,
}

impl GenerationLayout {
    /// Layout for `<role>-backup_` generations.
    pub fn for_role(role: &str) -> Self {
        Self::with_prefix(format!("{role}-backup_"))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of the generation started at `instant`.
    pub fn generation_name(&self, instant: DateTime<Utc>) -> String {
        format!("{}{}", self.prefix, instant.format(TIMESTAMP_FORMAT))
    }

    pub fn timestamp(&self, generation: &str) -> Option<DateTime<Utc>> {
        rotation::parse_instant(generation, &self.prefix, "")
    }

    pub fn object_key(&self, generation: &str, relative: &str) -> String {
        format!("{generation}/{relative}")
    }

    pub fn sentinel_key(&self, generation: &str, sentinel: &str) -> String {
        self.object_key(generation, sentinel)
    }

    /// Generation and relative path of a key under this layout.
    pub fn split_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        if !key.starts_with(&self.prefix) {
            return None;
        }
        let (generation, relative) = key.split_once('/')?;
        if relative.is_empty() {
            return None;
        }
        Some((generation, relative))
    }

    /// Lexicographically last generation that carries `sentinel`.
    pub fn latest_with_sentinel<'a, I>(&self, keys: I, sentinel: &str) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .filter_map(|key| self.split_key(key))
            .filter(|(_, relative)| *relative == sentinel)
            .map(|(generation, _)| generation)
            .max()
            .map(str::to_string)
    }

    /// Every generation seen in a listing, keyed by name.
    pub fn generations<'a, I>(&self, objects: I) -> BTreeMap<String, GenerationInfo>
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let mut generations: BTreeMap<String, GenerationInfo> = BTreeMap::new();

        for (key, size) in objects {
            let Some((generation, relative)) = self.split_key(key) else {
                continue;
            };
            let info = generations
                .entry(generation.to_string())
                .or_insert_with(|| GenerationInfo {
                    name: generation.to_string(),
                    timestamp: self.timestamp(generation),
                    state: GenerationState::Incomplete,
                    object_count: 0,
                    total_bytes: 0,
                });
            info.object_count += 1;
            info.total_bytes += size;

            let state = match relative {
                ARCHIVE_INFO => GenerationState::Archived,
                BACKUP_INFO => GenerationState::Raw,
                _ => GenerationState::Incomplete,
            };
            info.state = info.state.max(state);
        }

        generations
    }
}
