//! Packaging of many small files into one object.

use super::run_command;
use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait Archiver: Send + Sync {
    /// Pack `members` (paths relative to `base_dir`) into `output`.
    fn pack(&self, base_dir: &Path, members: &[String], output: &Path) -> Result<()>;

    /// Extract `archive` into `dest`, keeping member paths.
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// In-process tar implementation.
#[derive(Debug, Default, Clone)]
pub struct NativeTar;

impl Archiver for NativeTar {
    fn pack(&self, base_dir: &Path, members: &[String], output: &Path) -> Result<()> {
        let file = File::create(output)?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.follow_symlinks(true);

        for member in members {
            builder.append_path_with_name(base_dir.join(member), member)?;
        }

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        Ok(())
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let file = File::open(archive)?;
        let mut archive = tar::Archive::new(BufReader::new(file));
        archive.set_preserve_permissions(false);
        // unpack() refuses members that would escape `dest`.
        archive.unpack(dest)?;
        Ok(())
    }
}

/// The system `tar` binary.
#[derive(Debug, Clone)]
pub struct CommandTar {
    binary: PathBuf,
}

impl CommandTar {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Archiver for CommandTar {
    fn pack(&self, base_dir: &Path, members: &[String], output: &Path) -> Result<()> {
        if let Some(member) = members.iter().find(|m| m.contains('\n')) {
            return Err(EngineError::Subprocess(format!("cannot pass member {member:?} to tar")));
        }

        // Member list goes through a file so huge groups don't hit ARG_MAX.
        let list_path = output.with_extension("members");
        {
            let mut list = BufWriter::new(File::create(&list_path)?);
            for member in members {
                writeln!(list, "{member}")?;
            }
            list.flush()?;
        }

        let result = run_command(
            Command::new(&self.binary)
                .arg("--create")
                .arg("--file")
                .arg(output)
                .arg("--directory")
                .arg(base_dir)
                .arg("--verbatim-files-from")
                .arg("--files-from")
                .arg(&list_path),
        );
        let _ = std::fs::remove_file(&list_path);
        result.map(|_| ())
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        run_command(
            Command::new(&self.binary)
                .arg("--extract")
                .arg("--file")
                .arg(archive)
                .arg("--directory")
                .arg(dest),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_native_pack_unpack_keeps_member_paths() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("ab/cd"))?;
        fs::write(base.join("ab/cd/file1.gpg"), b"one")?;
        fs::write(base.join("top.gpg"), b"two")?;

        let package = dir.path().join("small-a.tar");
        let members = vec!["ab/cd/file1.gpg".to_string(), "top.gpg".to_string()];
        NativeTar.pack(&base, &members, &package)?;

        let out = dir.path().join("out");
        NativeTar.unpack(&package, &out)?;
        assert_eq!(fs::read(out.join("ab/cd/file1.gpg"))?, b"one");
        assert_eq!(fs::read(out.join("top.gpg"))?, b"two");
        Ok(())
    }

    #[test]
    fn test_native_pack_fails_on_missing_member() -> Result<()> {
        let dir = TempDir::new()?;
        let members = vec!["missing".to_string()];
        let result = NativeTar.pack(dir.path(), &members, &dir.path().join("p.tar"));
        assert!(result.is_err());
        Ok(())
    }

    /// GNU tar on PATH, which `--verbatim-files-from` needs.
    fn gnu_tar() -> Option<CommandTar> {
        let output = Command::new("tar").arg("--version").output().ok()?;
        let version = String::from_utf8_lossy(&output.stdout);
        (output.status.success() && version.contains("GNU tar")).then(|| CommandTar::new("tar"))
    }

    #[test]
    fn test_command_pack_unpack_keeps_member_paths() -> Result<()> {
        let Some(tar) = gnu_tar() else {
            eprintln!("GNU tar not found, skipping");
            return Ok(());
        };
        let dir = TempDir::new()?;
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("ab/cd"))?;
        fs::write(base.join("ab/cd/file one.gpg"), b"one")?;
        fs::write(base.join("-dash.gpg"), b"two")?;
        fs::write(base.join("not-a-member.gpg"), b"three")?;

        let package = dir.path().join("medium-3f.tar");
        let members = vec!["ab/cd/file one.gpg".to_string(), "-dash.gpg".to_string()];
        tar.pack(&base, &members, &package)?;
        assert!(!dir.path().join("medium-3f.members").exists());

        let out = dir.path().join("out");
        tar.unpack(&package, &out)?;
        assert_eq!(fs::read(out.join("ab/cd/file one.gpg"))?, b"one");
        assert_eq!(fs::read(out.join("-dash.gpg"))?, b"two");
        assert!(!out.join("not-a-member.gpg").exists());

        // Packages from either archiver read back with the other.
        let native_out = dir.path().join("native-out");
        NativeTar.unpack(&package, &native_out)?;
        assert_eq!(fs::read(native_out.join("-dash.gpg"))?, b"two");
        Ok(())
    }

    #[test]
    fn test_command_pack_rejects_newline_in_member() -> Result<()> {
        let dir = TempDir::new()?;
        let members = vec!["bad\nname".to_string()];
        let result = CommandTar::new("tar").pack(dir.path(), &members, &dir.path().join("p.tar"));
        assert!(matches!(result, Err(EngineError::Subprocess(_))));
        Ok(())
    }

    #[test]
    fn test_command_pack_fails_on_missing_member() -> Result<()> {
        let Some(tar) = gnu_tar() else {
            return Ok(());
        };
        let dir = TempDir::new()?;
        let members = vec!["missing".to_string()];
        assert!(tar.pack(dir.path(), &members, &dir.path().join("p.tar")).is_err());
        Ok(())
    }
}
