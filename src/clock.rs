use std::time::Instant;

use chrono::Utc;

/// Wall-clock stamps for observations plus a monotonic mark bounding the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn start() -> SessionClock {
        SessionClock { start: Instant::now() }
    }

    /// Milliseconds since the Unix epoch in UTC. Follows the system clock.
    pub fn now_ms(&self) -> u64 {
        let ms = Utc::now().timestamp_millis();
        if ms < 0 {
            0
        } else {
            ms as u64
        }
    }

    /// Milliseconds since `start`, unaffected by wall-clock adjustments.
    pub fn elapsed_ms(&self) -> u64 {
        let elapsed = self.start.elapsed().as_millis();
        if elapsed > u128::from(u64::MAX) {
            u64::MAX
        } else {
            elapsed as u64
        }
    }
}
