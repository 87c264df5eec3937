//! Request spacing for the platform HTTP clients

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Hands out request slots at least `interval` apart
///
/// Callers reserve the next free slot under the lock and sleep outside it,
/// so concurrent requests of one client queue up in reservation order.
pub(crate) struct RequestSpacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub(crate) fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for this caller's slot
    pub(crate) async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!(wait = ?(slot - Instant::now()), "Spacing platform request");
            tokio::time::sleep_until(slot).await;
        }
    }
}
