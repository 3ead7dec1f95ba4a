use std::time::Duration;

use tracing::warn;

use crate::error::TransferFailure;

/// Outcome of one failed attempt, tagged for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Retryable(TransferFailure),
    /// Stops the loop without spending the remaining budget.
    NonRetryable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    Exhausted { attempts: u32, last: TransferFailure },
    Aborted(String),
}

/// Runs an operation up to `max_attempts` times, sleeping between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingSleepRetry {
    max_attempts: u32,
    sleep: Duration,
}

impl CountingSleepRetry {
    /// A budget of zero still makes one attempt.
    pub fn new(max_attempts: u32, sleep: Duration) -> Self {
        CountingSleepRetry { max_attempts: max_attempts.max(1), sleep }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn sleep(&self) -> Duration {
        self.sleep
    }

    /// `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, AttemptError>,
    ) -> Result<T, RetryError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(AttemptError::NonRetryable(reason)) => {
                    return Err(RetryError::Aborted(reason));
                }
                Err(AttemptError::Retryable(failure)) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted { attempts: attempt, last: failure });
                    }
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %failure,
                        "transfer attempt failed, retrying"
                    );
                    if !self.sleep.is_zero() {
                        std::thread::sleep(self.sleep);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
