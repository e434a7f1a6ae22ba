//! Placement of files into an archive tree.
//!
//! Every placement ends with a rename onto the destination, so a destination
//! either holds a complete file or nothing, and repeating a placement after a
//! crash overwrites whatever an earlier attempt left behind.

use crate::utils::errors::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Renamed,
    Linked,
    Copied,
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

fn prepare(dest: &Path) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(dest);
    match fs::remove_file(&tmp) {
        Ok(()) => debug!("Removed leftover {}", tmp.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(tmp)
}

/// Move `src` to `dest`, replacing `dest`.
///
/// Falls back to copy + remove when the two paths are on different devices.
pub fn move_into(src: &Path, dest: &Path) -> Result<Placement> {
    let tmp = prepare(dest)?;
    match fs::rename(src, dest) {
        Ok(()) => Ok(Placement::Renamed),
        Err(e) if is_cross_device(&e) => {
            fs::copy(src, &tmp)?;
            fs::rename(&tmp, dest)?;
            fs::remove_file(src)?;
            Ok(Placement::Copied)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}

/// Hard-link `src` at `dest`, leaving `src` in place.
///
/// Falls back to [`move_into`] when the file system can't link.
pub fn link_into(src: &Path, dest: &Path) -> Result<Placement> {
    let tmp = prepare(dest)?;
    if same_file(src, dest) {
        return Ok(Placement::Linked);
    }
    match fs::hard_link(src, &tmp) {
        Ok(()) => {
            fs::rename(&tmp, dest)?;
            Ok(Placement::Linked)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e.into()),
        Err(e) => {
            debug!("Hard link of {} failed ({}), moving instead", src.display(), e);
            move_into(src, dest)
        }
    }
}
