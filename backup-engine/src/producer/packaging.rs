//! Grouping of pending files into packages.
//!
//! Files are first split by size class, then by the first characters of their
//! file name. The shard width grows with the number of pending files so that a
//! full backup of millions of files still produces packages of manageable size.

use crate::config::PackagingConfig;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn of(size: u64, limits: &PackagingConfig) -> Self {
        if size < limits.small_max_bytes {
            SizeClass::Small
        } else if size < limits.medium_max_bytes {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        };
        f.write_str(label)
    }
}

/// Shard width for `pending` files.
///
/// | Pending files   | Width |
/// |-----------------|-------|
/// | < 500           | 0     |
/// | < 10 000        | 1     |
/// | < 100 000       | 2     |
/// | < 1 000 000     | 3     |
/// | otherwise       | 4     |
pub fn shard_width(pending: usize) -> usize {
    match pending {
        0..=499 => 0,
        500..=9_999 => 1,
        10_000..=99_999 => 2,
        100_000..=999_999 => 3,
        _ => 4,
    }
}

/// Leading characters of the file name (last path component).
fn shard_of(path: &str, width: usize) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.chars()
        .take(width)
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// A file waiting to be backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub path: String,
    pub size: u64,
}

/// Files uploaded together as one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Object name without extension, unique within a generation
    pub label: String,
    pub class: SizeClass,
    pub files: Vec<PendingFile>,
}

impl Package {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Partition pending files into packages.
///
/// Small and medium files sharing a shard are grouped; every large file gets a
/// package of its own. Output order is deterministic.
pub fn plan_packages(pending: &[PendingFile], limits: &PackagingConfig) -> Vec<Package> {
    let width = shard_width(pending.len());
    let mut groups: BTreeMap<(SizeClass, String), Vec<PendingFile>> = BTreeMap::new();
    let mut large = Vec::new();

    for file in pending {
        match SizeClass::of(file.size, limits) {
            SizeClass::Large => large.push(file.clone()),
            class => groups
                .entry((class, shard_of(&file.path, width)))
                .or_default()
                .push(file.clone()),
        }
    }

    let mut packages: Vec<Package> = groups
        .into_iter()
        .map(|((class, shard), files)| Package {
            label: if shard.is_empty() {
                class.to_string()
            } else {
                format!("{class}-{shard}")
            },
            class,
            files,
        })
        .collect();

    for (index, file) in large.into_iter().enumerate() {
        packages.push(Package {
            label: format!("large-{index:06}"),
            class: SizeClass::Large,
            files: vec![file],
        });
    }

    packages
}
