// src/engine/timer.rs

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};

/// Singleton guard for a session's timer-like resources.
///
/// Re-renders and re-entrant effect registration must never produce a second
/// countdown or autosave interval: a duplicate means double decrement and
/// double save, which is a correctness bug rather than a performance one.
#[derive(Debug)]
pub struct TickGuard {
    name: &'static str,
    started: bool,
}

impl TickGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: false,
        }
    }

    /// Hands out the interval exactly once per session. Subsequent calls
    /// return `None` and log the attempt.
    pub fn start(&mut self, period: Duration) -> Option<Interval> {
        if self.started {
            tracing::warn!("Refusing duplicate '{}' interval", self.name);
            return None;
        }
        self.started = true;

        let mut ticker = interval(period);
        // Skip missed ticks after suspension instead of bursting; the
        // authoritative values are re-derived from absolute timestamps, so a
        // burst would only double-fire side effects.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(ticker)
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_start_is_refused() {
        let mut guard = TickGuard::new("countdown");
        assert!(!guard.started());

        let first = guard.start(Duration::from_millis(10));
        assert!(first.is_some());
        assert!(guard.started());

        let second = guard.start(Duration::from_millis(10));
        assert!(second.is_none());
    }
}
