//! Manifest types for incremental backup support.
//!
//! A manifest records every file in a generation with its plaintext size, the
//! location of its encrypted copy and the generation that physically holds the
//! encrypted bytes. It is stored as `BACKUP_INFO` (raw) or `ARCHIVE_INFO`
//! (archived), one tab-delimited line per file:
//!
//! ```text
//! path \t plaintext_size \t encrypted_path \t encrypted_size \t source_generation
//! ```

use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

const DELIMITER: char = '\t';
const FIELD_COUNT: usize = 5;

/// Whether a relative path can be stored in a manifest line.
pub fn is_storable_path(path: &str) -> bool {
    !path.is_empty() && !path.contains(['\t', '\n', '\r'])
}

/// Backup record of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path: String,
    pub plaintext_size: u64,
    pub encrypted_path: String,
    pub encrypted_size: u64,
    pub source_generation: String,
}

impl ManifestEntry {
    /// Render the entry as one manifest line, without the trailing newline.
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}{d}{}",
            self.path,
            self.plaintext_size,
            self.encrypted_path,
            self.encrypted_size,
            self.source_generation,
            d = DELIMITER,
        )
    }

    /// Parse one manifest line.
    pub fn decode(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() != FIELD_COUNT {
            return Err(EngineError::Manifest(format!(
                "expected {} fields, found {}",
                FIELD_COUNT,
                fields.len()
            )));
        }
        if fields[0].is_empty() || fields[2].is_empty() || fields[4].is_empty() {
            return Err(EngineError::Manifest("empty path or generation field".into()));
        }
        let parse_size = |field: &str, name: &str| {
            field
                .parse::<u64>()
                .map_err(|e| EngineError::Manifest(format!("invalid {name} '{field}': {e}")))
        };

        Ok(Self {
            path: fields[0].to_string(),
            plaintext_size: parse_size(fields[1], "plaintext size")?,
            encrypted_path: fields[2].to_string(),
            encrypted_size: parse_size(fields[3], "encrypted size")?,
            source_generation: fields[4].to_string(),
        })
    }

    /// The same entry, now held by `generation`.
    pub fn relocated(&self, generation: &str) -> Self {
        Self {
            source_generation: generation.to_string(),
            ..self.clone()
        }
    }
}

/// Ordered list of entries of one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse manifest bytes. Malformed lines are logged and skipped.
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut manifest = Manifest::new();

        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match ManifestEntry::decode(line) {
                Ok(entry) => manifest.push(entry),
                Err(e) => warn!("Skipping manifest line {}: {}", index + 1, e),
            }
        }

        manifest
    }

    /// Append an entry. Entries whose path cannot be stored are dropped.
    pub fn push(&mut self, entry: ManifestEntry) {
        if !is_storable_path(&entry.path) || !is_storable_path(&entry.encrypted_path) {
            warn!(path = ?entry.path, "Dropping manifest entry with a disallowed path");
            return;
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total plaintext bytes referenced by the manifest.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.plaintext_size).sum()
    }

    /// Index entries by path. Later duplicates win.
    pub fn by_path(&self) -> HashMap<String, ManifestEntry> {
        self.entries
            .iter()
            .map(|e| (e.path.clone(), e.clone()))
            .collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.encode());
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Write the manifest to `path` through a temporary sibling and a rename.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("partial");
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(Self::parse(&data))
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for entry in iter {
            manifest.push(entry);
        }
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            plaintext_size: 10,
            encrypted_path: format!("{path}.gpg"),
            encrypted_size: 74,
            source_generation: "file-broker-backup_2024-03-01T02:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for path in ["a", "dir/sub dir/file name.txt", "ä/ö/ü", "weird;,|chars"] {
            let original = entry(path);
            let decoded = ManifestEntry::decode(&original.encode()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_lines() {
        assert!(ManifestEntry::decode("only\tthree\tfields").is_err());
        assert!(ManifestEntry::decode("p\tnot-a-number\te\t1\tgen").is_err());
        assert!(ManifestEntry::decode("p\t1\te\t1\tgen\textra").is_err());
        assert!(ManifestEntry::decode("\t1\te\t1\tgen").is_err());
    }

    #[test]
    fn test_parse_skips_bad_lines_and_keeps_the_rest() {
        let text = format!(
            "{}\ngarbage line\n\n{}\np\t-1\te\t1\tg\n",
            entry("first").encode(),
            entry("second").encode()
        );
        let manifest = Manifest::parse(text.as_bytes());
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries()[0].path, "first");
        assert_eq!(manifest.entries()[1].path, "second");
    }

    #[test]
    fn test_push_drops_paths_with_delimiters() {
        let mut manifest = Manifest::new();
        manifest.push(entry("ok"));
        manifest.push(entry("tab\there"));
        manifest.push(entry("new\nline"));
        assert_eq!(manifest.len(), 1);
        assert!(!is_storable_path("carriage\rreturn"));
        assert!(!is_storable_path(""));
    }

    #[test]
    fn test_write_and_read_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("gen").join("ARCHIVE_INFO");
        let manifest: Manifest = vec![entry("a"), entry("b/c")].into_iter().collect();

        manifest.write_to(&path)?;
        assert_eq!(Manifest::read_from(&path)?, manifest);
        assert!(!path.with_extension("partial").exists());
        Ok(())
    }

    #[test]
    fn test_by_path_and_totals() {
        let manifest: Manifest = vec![entry("a"), entry("b")].into_iter().collect();
        let index = manifest.by_path();
        assert_eq!(index.len(), 2);
        assert_eq!(index["b"].encrypted_path, "b.gpg");
        assert_eq!(manifest.total_bytes(), 20);
    }

    #[test]
    fn test_relocated_rewrites_only_generation() {
        let original = entry("a");
        let moved = original.relocated("other");
        assert_eq!(moved.source_generation, "other");
        assert_eq!(moved.encrypted_path, original.encrypted_path);
    }
}
