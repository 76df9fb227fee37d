use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProcessingError;

/// How often a remote operation is re-attempted after a transient failure.
///
/// Delays grow exponentially: `base_delay_ms * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// Token issuance: transient faults are retried with backoff.
    pub const AUTH: RetryPolicy = RetryPolicy {
        max_retries: 5,
        base_delay_ms: 500,
    };

    /// Data calls: one attempt only, so a mutation is never sent twice.
    pub const SINGLE_ATTEMPT: RetryPolicy = RetryPolicy {
        max_retries: 0,
        base_delay_ms: 0,
    };

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T, ProcessingError>
    where
        F: FnMut() -> Result<T, ProcessingError>,
    {
        let mut attempt = 0u32;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::SINGLE_ATTEMPT
    }
}
