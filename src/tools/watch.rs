//! Stopwatch for timing handler invocations.

use std::time::Duration;
use tokio::time::Instant;

/// Measures the time since it was started.
///
/// Based on tokio's clock, so it follows a paused test runtime.
pub struct Watch {
    start: Instant,
}

impl Watch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed microseconds, saturating at `u64::MAX`.
    pub fn elapsed_us(&self) -> u64 {
        u64::try_from(self.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}
