use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::cache::MarketDataCache;
use crate::config::HealthSettings;
use crate::engine::ShutdownSignal;
use crate::exchange::{with_timeout, ExchangeConnector};
use crate::health::{Backoff, MemorySource};
use crate::logging::Heartbeat;
use crate::models::{HealthEvent, HealthEventKind};
use crate::persistence::JournalHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Connected, but a resource check failed
    Degraded,
    /// Connectivity lost, reconnect loop running
    Reconnecting,
}

/// Result of one round of checks
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub verdict: HealthVerdict,
    pub connected: bool,
    pub memory_usage: Option<f64>,
    pub cache_entries: usize,
    pub cache_purged: usize,
    pub logging_alive: bool,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn initial() -> Self {
        Self {
            verdict: HealthVerdict::Healthy,
            connected: true,
            memory_usage: None,
            cache_entries: 0,
            cache_purged: 0,
            logging_alive: true,
            issues: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    /// New entries are only opened while fully healthy
    pub fn allows_entries(&self) -> bool {
        self.verdict == HealthVerdict::Healthy
    }
}

/// Periodic liveness checks on their own task
///
/// Checks connectivity, memory, cache bound and logging in that order and
/// publishes every result on a watch channel. A failed ping turns into a
/// reconnect loop with capped exponential backoff that runs until the
/// exchange answers again or shutdown is requested.
pub struct HealthController {
    connector: Arc<dyn ExchangeConnector>,
    cache: Arc<Mutex<MarketDataCache>>,
    memory: Arc<dyn MemorySource>,
    heartbeat: Option<Heartbeat>,
    settings: HealthSettings,
    call_timeout: Duration,
    status_tx: watch::Sender<HealthStatus>,
    journal: JournalHandle,
    last_heartbeat: u64,
    last_verdict: HealthVerdict,
    memory_high: bool,
    reconnect_delays: Vec<Duration>,
}

impl HealthController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        cache: Arc<Mutex<MarketDataCache>>,
        memory: Arc<dyn MemorySource>,
        heartbeat: Option<Heartbeat>,
        settings: HealthSettings,
        call_timeout: Duration,
        status_tx: watch::Sender<HealthStatus>,
        journal: JournalHandle,
    ) -> Self {
        let last_heartbeat = heartbeat.as_ref().map_or(0, Heartbeat::count);
        Self {
            connector,
            cache,
            memory,
            heartbeat,
            settings,
            call_timeout,
            status_tx,
            journal,
            last_heartbeat,
            last_verdict: HealthVerdict::Healthy,
            memory_high: false,
            reconnect_delays: Vec::new(),
        }
    }

    /// Delays slept by the most recent reconnect loop
    pub fn reconnect_delays(&self) -> &[Duration] {
        &self.reconnect_delays
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) {
        tracing::info!(interval_secs = self.settings.interval_secs, "Health controller started");

        while !shutdown.is_triggered() {
            self.check_once(&shutdown).await;
            if !shutdown.sleep(self.settings.interval()).await {
                break;
            }
        }

        tracing::info!("Health controller stopped");
    }

    pub async fn check_once(&mut self, shutdown: &ShutdownSignal) -> HealthStatus {
        // 1. Connectivity
        let connected = match with_timeout(self.call_timeout, self.connector.ping()).await {
            Ok(()) => {
                self.reconnect_delays.clear();
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Health ping failed, reconnecting");
                self.journal.record_health_event(HealthEvent::new(
                    HealthEventKind::ConnectivityLost,
                    err.to_string(),
                ));
                self.reconnect(shutdown).await
            }
        };

        // 2-4. Memory, cache bound, logging
        let mut resources = self.check_resources();
        if !connected {
            resources.issues.insert(0, "exchange unreachable".to_string());
        }

        let verdict = if !connected {
            HealthVerdict::Reconnecting
        } else if resources.issues.is_empty() {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Degraded
        };

        let status = resources.into_status(verdict, connected);
        if verdict != self.last_verdict {
            tracing::info!(from = ?self.last_verdict, to = ?verdict, "Health changed");
        } else {
            tracing::debug!(?verdict, cache_entries = status.cache_entries, "Health check complete");
        }
        self.last_verdict = verdict;
        self.status_tx.send_replace(status.clone());
        status
    }

    fn check_resources(&mut self) -> Resources {
        let mut issues = Vec::new();

        let memory_usage = self.memory.usage();
        let threshold = self.settings.memory_threshold;
        let high_usage = memory_usage.filter(|usage| *usage > threshold);
        if let Some(usage) = high_usage {
            tracing::warn!(
                usage,
                threshold,
                "Memory usage above threshold"
            );
            issues.push(format!("memory usage {:.2}", usage));
            if !self.memory_high {
                self.journal.record_health_event(HealthEvent::new(
                    HealthEventKind::MemoryHigh,
                    format!("usage {:.3}", usage),
                ));
            }
        }
        self.memory_high = high_usage.is_some();

        let (cache_entries, cache_purged, bound) = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let purged = cache.purge_expired() + cache.enforce_bound();
            (cache.len(), purged, cache.bound())
        };
        if cache_entries > bound {
            issues.push(format!("cache holds {} of {}", cache_entries, bound));
            self.journal.record_health_event(HealthEvent::new(
                HealthEventKind::CacheOverBound,
                format!("{} entries, bound {}", cache_entries, bound),
            ));
        }

        let logging_alive = match &self.heartbeat {
            Some(heartbeat) => {
                heartbeat.beat();
                let count = heartbeat.count();
                let alive = count > self.last_heartbeat;
                self.last_heartbeat = count;
                alive
            }
            None => true,
        };
        if !logging_alive {
            issues.push("logging stalled".to_string());
            self.journal.record_health_event(HealthEvent::new(
                HealthEventKind::LoggingStalled,
                "heartbeat counter did not advance",
            ));
        }

        Resources {
            memory_usage,
            cache_entries,
            cache_purged,
            logging_alive,
            issues,
        }
    }

    /// Resource checks keep running while the exchange is away
    fn publish_reconnecting(&mut self, attempt: u32) {
        let mut resources = self.check_resources();
        resources
            .issues
            .insert(0, format!("reconnect attempt {}", attempt));
        self.status_tx
            .send_replace(resources.into_status(HealthVerdict::Reconnecting, false));
        self.last_verdict = HealthVerdict::Reconnecting;
    }

    /// Retry until the exchange answers; false only if shutdown interrupted
    ///
    /// Backoff delays longer than the check interval are slept in
    /// interval-sized steps, with resource checks published at each step.
    async fn reconnect(&mut self, shutdown: &ShutdownSignal) -> bool {
        let mut backoff = Backoff::from_settings(&self.settings);
        let interval = self.settings.interval().max(Duration::from_millis(1));
        self.reconnect_delays.clear();

        loop {
            let delay = backoff.next_delay();
            self.publish_reconnecting(backoff.attempts());

            tracing::warn!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to exchange"
            );
            self.reconnect_delays.push(delay);

            let mut remaining = delay;
            loop {
                let step = remaining.min(interval);
                if !shutdown.sleep(step).await {
                    return false;
                }
                remaining = remaining.saturating_sub(step);
                if remaining.is_zero() {
                    break;
                }
                self.publish_reconnecting(backoff.attempts());
            }

            if let Err(err) = with_timeout(self.call_timeout, self.connector.reconnect()).await {
                tracing::warn!(error = %err, "Reconnect failed");
                continue;
            }

            match with_timeout(self.call_timeout, self.connector.ping()).await {
                Ok(()) => {
                    tracing::info!(attempts = backoff.attempts(), "Exchange connectivity restored");
                    self.journal.record_health_event(HealthEvent::new(
                        HealthEventKind::Reconnected,
                        format!("after {} attempts", backoff.attempts()),
                    ));
                    return true;
                }
                Err(err) => tracing::warn!(error = %err, "Ping after reconnect failed"),
            }
        }
    }
}

/// Memory, cache and logging results of one round
struct Resources {
    memory_usage: Option<f64>,
    cache_entries: usize,
    cache_purged: usize,
    logging_alive: bool,
    issues: Vec<String>,
}

impl Resources {
    fn into_status(self, verdict: HealthVerdict, connected: bool) -> HealthStatus {
        HealthStatus {
            verdict,
            connected,
            memory_usage: self.memory_usage,
            cache_entries: self.cache_entries,
            cache_purged: self.cache_purged,
            logging_alive: self.logging_alive,
            issues: self.issues,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::error::ExchangeError;
    use crate::exchange::{PaperExchange, PaperOp};
    use crate::health::FixedMemory;
    use crate::models::{MarketSnapshot, Timeframe};
    use crate::persistence::{spawn_writer, MemoryJournal};

    struct Fixture {
        controller: HealthController,
        exchange: Arc<PaperExchange>,
        cache: Arc<Mutex<MarketDataCache>>,
        status_rx: watch::Receiver<HealthStatus>,
    }

    fn fixture(memory: f64) -> Fixture {
        let exchange = Arc::new(PaperExchange::new(10_000.0, "USDT"));
        let cache = Arc::new(Mutex::new(MarketDataCache::new(3, Duration::from_secs(60))));
        let (status_tx, status_rx) = watch::channel(HealthStatus::initial());
        let (journal, _) = spawn_writer(Arc::new(MemoryJournal::new()), 16);

        let controller = HealthController::new(
            exchange.clone(),
            cache.clone(),
            Arc::new(FixedMemory::new(memory)),
            None,
            HealthSettings::default(),
            Duration::from_secs(5),
            status_tx,
            journal,
        );
        Fixture {
            controller,
            exchange,
            cache,
            status_rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_check() {
        let mut fx = fixture(0.5);
        let status = fx.controller.check_once(&ShutdownSignal::new()).await;

        assert_eq!(status.verdict, HealthVerdict::Healthy);
        assert!(status.allows_entries());
        assert_eq!(fx.status_rx.borrow().verdict, HealthVerdict::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_memory_degrades() {
        let mut fx = fixture(0.95);
        let status = fx.controller.check_once(&ShutdownSignal::new()).await;

        assert_eq!(status.verdict, HealthVerdict::Degraded);
        assert!(!status.allows_entries());
        assert_eq!(status.memory_usage, Some(0.95));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backs_off_until_ping_answers() {
        let mut fx = fixture(0.5);
        fx.exchange
            .fail_times(PaperOp::Ping, 3, ExchangeError::Transient("connection reset".into()));

        let status = fx.controller.check_once(&ShutdownSignal::new()).await;

        assert_eq!(status.verdict, HealthVerdict::Healthy);
        assert_eq!(
            fx.controller.reconnect_delays(),
            &[
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(fx.exchange.calls(PaperOp::Ping), 4);
        assert_eq!(fx.exchange.calls(PaperOp::Reconnect), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_reconnect() {
        let mut fx = fixture(0.5);
        fx.exchange
            .fail_times(PaperOp::Ping, 100, ExchangeError::Transient("down".into()));
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let status = fx.controller.check_once(&shutdown).await;
        assert_eq!(status.verdict, HealthVerdict::Reconnecting);
        assert!(!status.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_checks_continue_during_reconnect() {
        let fx = fixture(0.95);
        fx.exchange
            .fail_times(PaperOp::Ping, 100, ExchangeError::Transient("down".into()));
        fx.cache.lock().unwrap().put(
            CacheKey::new("A", Timeframe::M1),
            MarketSnapshot::new("A", Timeframe::M1, Vec::new()),
        );

        let shutdown = ShutdownSignal::new();
        let mut controller = fx.controller;
        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { controller.check_once(&task_shutdown).await });

        // Backoff is at 32s by now, longer than the 30s interval
        tokio::time::sleep(Duration::from_secs(70)).await;
        let status = fx.status_rx.borrow().clone();
        assert_eq!(status.verdict, HealthVerdict::Reconnecting);
        assert!(!status.connected);
        assert_eq!(status.memory_usage, Some(0.95));
        assert_eq!(fx.cache.lock().unwrap().len(), 0);

        shutdown.trigger();
        let status = task.await.unwrap();
        assert_eq!(status.verdict, HealthVerdict::Reconnecting);
        assert!(status.issues.iter().any(|i| i.contains("memory usage")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_is_purged_and_bounded() {
        let mut fx = fixture(0.5);
        {
            let mut cache = fx.cache.lock().unwrap();
            for symbol in ["A", "B", "C"] {
                cache.put(
                    CacheKey::new(symbol, Timeframe::M1),
                    MarketSnapshot::new(symbol, Timeframe::M1, Vec::new()),
                );
            }
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let status = fx.controller.check_once(&ShutdownSignal::new()).await;
        assert_eq!(status.cache_entries, 0);
        assert_eq!(status.cache_purged, 3);
    }
}
