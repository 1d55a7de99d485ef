use std::time::Duration;

use crate::config::HealthSettings;

/// Capped exponential backoff: base, 2×base, 4×base, … never above max
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_base_ms),
            Duration::from_millis(settings.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
