use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::HealthSettings;

/// Restart timestamps within a trailing window
///
/// Survives individual engine runs; the supervisor consults it before every
/// restart.
#[derive(Debug, Clone)]
pub struct RestartLedger {
    max_restarts: usize,
    window: chrono::Duration,
    restarts: VecDeque<DateTime<Utc>>,
}

impl RestartLedger {
    pub fn new(max_restarts: usize, window: Duration) -> Self {
        Self {
            max_restarts,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1)),
            restarts: VecDeque::new(),
        }
    }

    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self::new(
            settings.max_restarts_per_hour,
            Duration::from_secs(settings.restart_window_secs),
        )
    }

    pub fn max_restarts(&self) -> usize {
        self.max_restarts
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Drop restarts that fell out of the window
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.restarts.front().is_some_and(|t| *t <= cutoff) {
            self.restarts.pop_front();
        }
    }

    pub fn can_restart(&mut self, now: DateTime<Utc>) -> bool {
        self.count(now) < self.max_restarts
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        // Keep chronological order even if the clock stepped back
        let position = self.restarts.partition_point(|t| *t <= at);
        self.restarts.insert(position, at);
    }

    pub fn count(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.restarts.len()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.restarts.iter()
    }

    /// Merge restarts recovered from an external mirror
    pub fn restore(&mut self, timestamps: impl IntoIterator<Item = DateTime<Utc>>) {
        for at in timestamps {
            if !self.restarts.contains(&at) {
                self.record(at);
            }
        }
    }
}
