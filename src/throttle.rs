//! Process-wide output rate limit.
//!
//! Reservations are served in arrival order against a virtual cursor: each
//! one occupies `ceil(tokens / max_tps)` of wall time starting at
//! `max(now, cursor)`. The lock is held only to move the cursor, never while
//! sleeping.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Shared throttle for all workers.
#[derive(Debug)]
pub struct ThrottleCoordinator {
    max_tps: Option<f64>,
    cursor: Mutex<Option<Instant>>,
}

impl ThrottleCoordinator {
    /// `None`, zero or a non-finite rate disables throttling.
    pub fn new(max_tps: Option<f64>) -> Self {
        Self {
            max_tps: max_tps.filter(|tps| tps.is_finite() && *tps > 0.0),
            cursor: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_tps.is_some()
    }

    /// Time slot a reservation of `tokens` occupies.
    pub fn slot_duration(&self, tokens: usize) -> Duration {
        match self.max_tps {
            Some(tps) if tokens > 0 => {
                let ms = (tokens as f64 / tps * 1000.0).ceil();
                Duration::from_millis(ms as u64)
            }
            _ => Duration::ZERO,
        }
    }

    /// Reserve a slot and wait until it ends.
    pub async fn reserve(&self, tokens: usize) {
        if !self.is_enabled() || tokens == 0 {
            return;
        }

        let finish = {
            let mut cursor = self.cursor.lock().await;
            let now = Instant::now();
            let start = cursor.map_or(now, |c| c.max(now));
            let finish = start + self.slot_duration(tokens);
            *cursor = Some(finish);
            finish
        };

        let wait = finish.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(tokens, wait_ms = wait.as_millis() as u64, "Throttling submit");
        }
        sleep_until(finish).await;
    }
}
