use std::time::Duration;

use tokio::time::Instant;

/// Unlock-at bookkeeping for a single rate-limited action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownState {
    unlock_at: Option<Instant>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.unlock_at
            .map(|unlock_at| unlock_at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Whole seconds until unlock, rounded up.
    pub fn remaining_seconds(&self, now: Instant) -> u64 {
        let remaining = self.remaining(now);
        let secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        !self.remaining(now).is_zero()
    }

    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.unlock_at = Some(now + duration);
    }

    pub fn clear(&mut self) {
        self.unlock_at = None;
    }
}
