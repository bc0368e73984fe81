//! Rate limiting between consumed items.

use tokio::time::{sleep_until, Duration, Instant};

/// Bounds how many bytes per second a scan may pull from storage.
///
/// The delay is a cooperative suspension point between items; nothing is
/// ever pre-empted mid-item. A limit of zero disables throttling entirely,
/// which is how secondaries run batch verification.
#[derive(Debug)]
pub struct DataThrottle {
    max_bytes_per_sec: u64,
    window_start: Instant,
    bytes_in_window: u64,
}

impl DataThrottle {
    /// Throttle to `mb_per_sec` MiB per second. Zero disables.
    pub fn new(mb_per_sec: u64) -> Self {
        Self {
            max_bytes_per_sec: mb_per_sec * 1024 * 1024,
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }

    /// A throttle that never delays.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Account for `bytes` just read; sleep out the rest of the current
    /// one-second window if the budget is exhausted.
    pub async fn await_if_needed(&mut self, bytes: u64) {
        if self.max_bytes_per_sec == 0 {
            return;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.bytes_in_window = 0;
        }

        self.bytes_in_window += bytes;
        if self.bytes_in_window >= self.max_bytes_per_sec {
            let window_end = self.window_start + Duration::from_secs(1);
            sleep_until(window_end).await;
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
    }
}
