//! Throttled download progress.
//!
//! A transfer can deliver thousands of chunks per second; listeners only
//! want a heartbeat. The sampler turns a running byte count into at most
//! one reading per interval, each carrying the transfer rate measured
//! since the previous reading.

use std::time::{Duration, Instant};

pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ProgressSampler {
    interval: Duration,
    last_emit: Option<Instant>,
    last_bytes: u64,
}

impl ProgressSampler {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_bytes: 0,
        }
    }

    /// Feeds the current cumulative byte count. Returns the observed
    /// bytes-per-second rate when a new reading is due, `None` while the
    /// interval has not elapsed. The very first call always produces a
    /// reading so listeners see the transfer begin.
    pub(crate) fn sample(&mut self, bytes: u64) -> Option<f64> {
        let now = Instant::now();
        match self.last_emit {
            None => {
                self.last_emit = Some(now);
                self.last_bytes = bytes;
                Some(0.0)
            }
            Some(previous) => {
                let elapsed = now.duration_since(previous);
                if elapsed < self.interval {
                    return None;
                }
                let delta = bytes.saturating_sub(self.last_bytes);
                let rate = delta as f64 / elapsed.as_secs_f64();
                self.last_emit = Some(now);
                self.last_bytes = bytes;
                Some(rate)
            }
        }
    }
}
