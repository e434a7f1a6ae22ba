//! Per-file encryption.

use super::run_command;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait Encryptor: Send + Sync {
    /// Encrypt `input` into `output`.
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()>;

    /// Inverse of [`Encryptor::encrypt`], used by restores.
    fn decrypt(&self, input: &Path, output: &Path) -> Result<()>;

    /// Appended to a file's path to name its encrypted copy.
    fn suffix(&self) -> &str;
}

/// Public-key encryption for a fixed recipient with the `gpg` binary.
#[derive(Debug, Clone)]
pub struct GpgEncryptor {
    binary: PathBuf,
    recipient: String,
    passphrase_file: Option<PathBuf>,
}

impl GpgEncryptor {
    pub fn new(binary: impl Into<PathBuf>, recipient: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            recipient: recipient.into(),
            passphrase_file: None,
        }
    }

    /// Passphrase of the secret key, needed only for decryption.
    pub fn with_passphrase_file(mut self, path: Option<PathBuf>) -> Self {
        self.passphrase_file = path;
        self
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(["--batch", "--yes", "--quiet"]);
        command
    }
}

impl Encryptor for GpgEncryptor {
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()> {
        run_command(
            self.base_command()
                .arg("--trust-model")
                .arg("always")
                .arg("--recipient")
                .arg(&self.recipient)
                .arg("--output")
                .arg(output)
                .arg("--encrypt")
                .arg(input),
        )?;
        Ok(())
    }

    fn decrypt(&self, input: &Path, output: &Path) -> Result<()> {
        let mut command = self.base_command();
        if let Some(passphrase_file) = &self.passphrase_file {
            command
                .arg("--pinentry-mode")
                .arg("loopback")
                .arg("--passphrase-file")
                .arg(passphrase_file);
        }
        run_command(command.arg("--output").arg(output).arg("--decrypt").arg(input))?;
        Ok(())
    }

    fn suffix(&self) -> &str {
        ".gpg"
    }
}

/// Stores files as-is, for deployments whose bucket is already encrypted at rest.
#[derive(Debug, Default, Clone)]
pub struct PassthroughEncryptor;

impl Encryptor for PassthroughEncryptor {
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()> {
        std::fs::copy(input, output)?;
        Ok(())
    }

    fn decrypt(&self, input: &Path, output: &Path) -> Result<()> {
        std::fs::copy(input, output)?;
        Ok(())
    }

    fn suffix(&self) -> &str {
        ""
    }
}
