//! Outbound rate pacing.
//!
//! The sender measures how many bytes left in the current window and sleeps
//! whenever the instantaneous rate exceeds the target. Windows are one chunk
//! long (target / 1000 bytes) so the pacing granularity stays near one
//! millisecond at every target speed. A pause in traffic longer than
//! [`IDLE_RESET`] discards the window, otherwise the first burst after
//! quiescence would be paced against stale elapsed time.

use std::time::Duration;

use tokio::time::Instant;

use fathom_core::config::TargetSpeed;

/// Idle gap that resets the measurement window.
pub const IDLE_RESET: Duration = Duration::from_millis(4);

#[derive(Debug)]
pub struct RatePacer {
    target: f64,
    chunk_limit: f64,
    chunk: f64,
    window: Instant,
}

impl RatePacer {
    pub fn new(speed: TargetSpeed) -> Self {
        let target = speed.bytes_per_sec() as f64;
        Self {
            target,
            chunk_limit: target / 1000.0,
            chunk: 0.0,
            window: Instant::now(),
        }
    }

    pub fn set_target(&mut self, speed: TargetSpeed) {
        self.target = speed.bytes_per_sec() as f64;
        self.chunk_limit = self.target / 1000.0;
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Call before sending a message. Discards the window after an idle gap.
    pub fn start_burst(&mut self) {
        if self.window.elapsed() > IDLE_RESET {
            self.window = Instant::now();
            self.chunk = 0.0;
        }
    }

    /// Account one sent datagram, suspending when the measured rate runs
    /// ahead of the target. The window restarts once the limit is crossed,
    /// after any sleep, so sleep time never counts as elapsed time.
    pub async fn sent(&mut self, bytes: usize) {
        self.chunk += bytes as f64;
        if self.chunk <= self.chunk_limit {
            return;
        }

        let elapsed = self.window.elapsed().as_secs_f64();
        if self.chunk > self.target * elapsed {
            let pause = self.chunk / self.target - elapsed;
            if pause > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(pause)).await;
            }
        }

        self.window = Instant::now();
        self.chunk = 0.0;
    }
}
