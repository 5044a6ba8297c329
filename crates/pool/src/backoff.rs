use std::time::Duration;

use crossbeam_channel::{Receiver, after, select};
use parking_lot::RwLock;

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 6;

struct Progress {
    delay: Duration,
    failures: u32,
}

/// Delay applied between restarts of a crashing worker script.
///
/// The delay doubles on every consecutive failure, starting from `min` and
/// capped at `max`. A healthy script never waits.
pub struct ExponentialBackoff {
    progress: RwLock<Progress>,
    min: Duration,
    max: Duration,
    /// `None` never escalates.
    max_consecutive_failures: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_MIN_BACKOFF,
            DEFAULT_MAX_BACKOFF,
            Some(DEFAULT_MAX_CONSECUTIVE_FAILURES),
        )
    }
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration, max_consecutive_failures: Option<u32>) -> Self {
        Self {
            progress: RwLock::new(Progress {
                delay: min,
                failures: 0,
            }),
            min,
            max: max.max(min),
            max_consecutive_failures,
        }
    }

    pub fn record_success(&self) {
        let mut progress = self.progress.write();
        progress.failures = 0;
        progress.delay = self.min;
    }

    /// Returns true once the configured number of consecutive failures is reached.
    pub fn record_failure(&self) -> bool {
        let mut progress = self.progress.write();
        progress.failures += 1;
        progress.delay = progress.delay.max(self.min).saturating_mul(2).min(self.max);

        match self.max_consecutive_failures {
            Some(limit) => progress.failures >= limit,
            None => false,
        }
    }

    /// Sleep for the current delay, but only after at least one failure.
    /// Returns false when `interrupt` disconnected before the delay ran out.
    pub fn wait(&self, interrupt: &Receiver<()>) -> bool {
        let delay = {
            let progress = self.progress.read();
            if progress.failures == 0 {
                return true;
            }
            progress.delay
        };
        select! {
            recv(interrupt) -> _ => false,
            recv(after(delay)) -> _ => true,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.progress.read().failures
    }

    pub fn current_delay(&self) -> Duration {
        self.progress.read().delay
    }
}
