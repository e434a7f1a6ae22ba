//! Directory traversal of the storage volume.
//!
//! Produces `relative path → size` for every regular file under a root. Paths
//! are `/`-separated regardless of platform so they can be stored in manifests.

use crate::manifest::is_storable_path;
use crate::utils::errors::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Directories that are never descended into (absolute paths)
    pub exclude_dirs: Vec<PathBuf>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: true,
            exclude_dirs: Vec::new(),
        }
    }
}

/// Files found by a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Relative path to size, sorted by path
    pub files: BTreeMap<String, u64>,

    /// Entries skipped because their name cannot be stored
    pub skipped: usize,
}

impl ScanResult {
    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum()
    }
}

/// Walk `root` and collect every regular file.
///
/// # Arguments
/// * `root` - Root directory to start walking from
/// * `options` - Symlink handling and excluded directories
///
/// # Returns
/// * `Ok(ScanResult)` - Files keyed by relative path
/// * `Err(EngineError)` - If the tree cannot be read
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{scan, WalkOptions};
/// use std::path::Path;
///
/// let result = scan(Path::new("/mnt/storage"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", result.files.len());
/// ```
pub fn scan(root: &Path, options: &WalkOptions) -> Result<ScanResult> {
    let mut result = ScanResult::default();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry, &options.exclude_dirs));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_skippable(&e) => {
                warn!("Skipping unreadable entry: {}", e);
                result.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        // Skip directories and anything that isn't (or doesn't resolve to) a regular file
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(key) = relative_key(relative) else {
            warn!("Skipping file with a non UTF-8 name: {}", entry.path().display());
            result.skipped += 1;
            continue;
        };
        if !is_storable_path(&key) {
            warn!("Skipping file with a delimiter in its name: {:?}", key);
            result.skipped += 1;
            continue;
        }

        let size = entry.metadata()?.len();
        result.files.insert(key, size);
    }

    Ok(result)
}

/// `/`-joined UTF-8 form of a relative path.
fn relative_key(relative: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/"))
}

/// Dangling symlinks, files deleted mid-walk and symlink loops.
fn is_skippable(err: &walkdir::Error) -> bool {
    err.loop_ancestor().is_some()
        || err
            .io_error()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

fn is_excluded(entry: &DirEntry, exclude_dirs: &[PathBuf]) -> bool {
    entry.file_type().is_dir() && exclude_dirs.iter().any(|dir| entry.path() == dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let result = scan(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(result.files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_scan_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"1234567")?;

        let result = scan(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files["file1.txt"], 5);
        assert_eq!(result.files["subdir/file2.txt"], 7);
        assert_eq!(result.total_bytes(), 12);

        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_not_descended() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let scratch = temp_dir.path().join("scratch");
        fs::create_dir(&scratch)?;
        fs::write(scratch.join("tmp.tar"), b"x")?;
        fs::write(temp_dir.path().join("keep"), b"x")?;

        let options = WalkOptions {
            exclude_dirs: vec![scratch],
            ..WalkOptions::default()
        };
        let result = scan(temp_dir.path(), &options)?;
        assert_eq!(result.files.keys().collect::<Vec<_>>(), vec!["keep"]);
        Ok(())
    }

    #[test]
    fn test_names_with_delimiters_are_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("tab\tname"), b"x")?;
        fs::write(temp_dir.path().join("fine"), b"x")?;

        let result = scan(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.skipped, 1);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_followed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("target"), b"123")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("linked"))?;

        let result = scan(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(result.files.get("linked/target"), Some(&3));
        Ok(())
    }
}
