//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    /// The newest generation timestamp is implausible; nothing was deleted.
    #[error("Clock sanity check failed: {0}")]
    ClockSanity(String),

    #[error("Lock held: {0}")]
    Locked(String),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Whether a retry of the same remote call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_body()
                    || e
                        .status()
                        .map(|s| s.as_u16() == 429 || s.is_server_error())
                        .unwrap_or(false)
            }
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
