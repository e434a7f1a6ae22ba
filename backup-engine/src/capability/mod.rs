//! External capabilities: packaging and encryption.
//!
//! Both sit behind traits so runs can be exercised with in-process
//! implementations; production binds them to `tar` and `gpg`.

pub mod archiver;
pub mod encryptor;

use crate::utils::errors::{EngineError, Result};
use std::process::{Command, Output};

pub use archiver::{Archiver, CommandTar, NativeTar};
pub use encryptor::{Encryptor, GpgEncryptor, PassthroughEncryptor};

/// Run a subprocess to completion, turning a non-zero exit into an error.
pub(crate) fn run_command(command: &mut Command) -> Result<Output> {
    let program = command.get_program().to_string_lossy().to_string();
    tracing::debug!("Running {:?}", command);

    let output = command
        .output()
        .map_err(|e| EngineError::Subprocess(format!("failed to start {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Subprocess(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}
