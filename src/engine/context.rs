use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use crate::cache::MarketDataCache;
use crate::config::Settings;
use crate::engine::{EngineState, ShutdownSignal};
use crate::exchange::ExchangeConnector;
use crate::health::{HealthStatus, RestartLedger};
use crate::persistence::JournalHandle;

/// Everything one engine run shares, passed explicitly to its components
///
/// The cache and restart ledger are the only state the orchestrator and the
/// health task both touch; each sits behind its own mutex and is never held
/// across an await. `state` is owned by the orchestrator but shared with the
/// supervisor so it survives restarts; it follows the same locking rule.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub settings: Arc<Settings>,
    pub connector: Arc<dyn ExchangeConnector>,
    pub cache: Arc<Mutex<MarketDataCache>>,
    pub ledger: Arc<Mutex<RestartLedger>>,
    pub health_rx: watch::Receiver<HealthStatus>,
    pub shutdown: ShutdownSignal,
    pub journal: JournalHandle,
    pub state: Arc<Mutex<EngineState>>,
    last_cycle_ms: Arc<AtomicI64>,
}

impl OrchestratorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn ExchangeConnector>,
        cache: Arc<Mutex<MarketDataCache>>,
        ledger: Arc<Mutex<RestartLedger>>,
        health_rx: watch::Receiver<HealthStatus>,
        shutdown: ShutdownSignal,
        journal: JournalHandle,
    ) -> Self {
        let state = EngineState::shared(settings.risk.clone());
        Self {
            settings,
            connector,
            cache,
            ledger,
            health_rx,
            shutdown,
            journal,
            state,
            last_cycle_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Use state carried over from an earlier run instead of a fresh one
    pub fn with_state(mut self, state: Arc<Mutex<EngineState>>) -> Self {
        self.state = state;
        self
    }

    pub fn mark_cycle(&self, at: DateTime<Utc>) {
        self.last_cycle_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// When the last cycle completed, if any has
    pub fn last_successful_cycle(&self) -> Option<DateTime<Utc>> {
        match self.last_cycle_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.health_rx.borrow().clone()
    }
}
