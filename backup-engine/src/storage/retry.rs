use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::errors::Result;

/// Bounded exponential backoff for remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Retry `f` on transient errors with exponential backoff + jitter.
///
/// Permanent errors and the last transient error are returned as-is.
pub fn retry_call<T>(
    config: &RetryConfig,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt,
                    config.max_retries,
                );
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
            }
            Err(e) => return Err(e),
        }
    }
}
