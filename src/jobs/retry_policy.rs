//! Retry policy for failed jobs.
//!
//! Bounded retries with exponential backoff between attempts.

use crate::config::JobsSettings;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts a job gets before it is given up as MAX_TRIES_EXCEEDED.
    pub max_tries: u32,
    /// Delay before the first retry, in seconds.
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth, in seconds.
    pub max_backoff_secs: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &JobsSettings) -> Self {
        Self {
            max_tries: settings.max_tries,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Whether a job that has failed `tries` times gets another attempt.
    pub fn should_retry(&self, tries: u32) -> bool {
        tries < self.max_tries
    }

    /// Delay before the attempt following failure number `tries`.
    ///
    /// `initial_backoff * multiplier^(tries - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, tries: u32) -> u64 {
        let exponent = tries.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    /// Unix millisecond timestamp before which the job must not be claimed.
    pub fn next_attempt_at(&self, tries: u32, now_millis: i64) -> i64 {
        now_millis + (self.backoff_secs(tries) as i64).saturating_mul(1000)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&JobsSettings::default())
    }
}
