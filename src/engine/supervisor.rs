use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::MarketDataCache;
use crate::config::Settings;
use crate::engine::{EngineState, Orchestrator, OrchestratorContext, ShutdownSignal};
use crate::error::EngineError;
use crate::exchange::ExchangeConnector;
use crate::health::{HealthController, HealthStatus, MemorySource, RestartLedger};
use crate::logging::Heartbeat;
use crate::models::{HealthEvent, HealthEventKind};
use crate::persistence::{JournalHandle, RedisLedgerMirror};
use crate::strategy::{self, Strategy};

type StrategyFactory = Box<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the engine and restarts it after fatal failures, within budget
///
/// Each run gets fresh components (cache, executor, health task, strategy)
/// built from the same settings. The restart ledger and the engine state
/// (open positions, circuit breakers) outlive runs.
pub struct Supervisor {
    settings: Arc<Settings>,
    connector: Arc<dyn ExchangeConnector>,
    ledger: Arc<Mutex<RestartLedger>>,
    state: Arc<Mutex<EngineState>>,
    shutdown: ShutdownSignal,
    journal: JournalHandle,
    memory: Arc<dyn MemorySource>,
    heartbeat: Option<Heartbeat>,
    mirror: Option<RedisLedgerMirror>,
    strategy_factory: StrategyFactory,
    runs: usize,
}

impl Supervisor {
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn ExchangeConnector>,
        ledger: RestartLedger,
        shutdown: ShutdownSignal,
        journal: JournalHandle,
        memory: Arc<dyn MemorySource>,
    ) -> Self {
        let strategy_settings = settings.strategy.clone();
        let state = EngineState::shared(settings.risk.clone());
        Self {
            settings,
            connector,
            ledger: Arc::new(Mutex::new(ledger)),
            state,
            shutdown,
            journal,
            memory,
            heartbeat: None,
            mirror: None,
            strategy_factory: Box::new(move || strategy::from_settings(&strategy_settings)),
            runs: 0,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_mirror(mut self, mirror: RedisLedgerMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_strategy_factory(
        mut self,
        factory: impl Fn() -> Box<dyn Strategy> + Send + Sync + 'static,
    ) -> Self {
        self.strategy_factory = Box::new(factory);
        self
    }

    pub fn ledger(&self) -> Arc<Mutex<RestartLedger>> {
        self.ledger.clone()
    }

    pub fn state(&self) -> Arc<Mutex<EngineState>> {
        self.state.clone()
    }

    /// Runs started so far, including the first
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub async fn run(&mut self) -> Result<(), EngineError> {
        loop {
            self.runs += 1;
            let failure = match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if self.shutdown.is_triggered() {
                tracing::warn!(error = %failure, "Run failed during shutdown, not restarting");
                return Ok(());
            }

            let now = Utc::now();
            let (allowed, restarts) = {
                let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
                if ledger.can_restart(now) {
                    ledger.record(now);
                    (true, ledger.count(now))
                } else {
                    (false, ledger.count(now))
                }
            };

            if !allowed {
                let window_secs = self.settings.health.restart_window_secs;
                tracing::error!(
                    alert = true,
                    restarts,
                    window_secs,
                    error = %failure,
                    "Restart budget exhausted, halting"
                );
                self.journal.record_health_event(HealthEvent::new(
                    HealthEventKind::RestartBudgetExhausted,
                    format!("{} restarts within {}s; last failure: {}", restarts, window_secs, failure),
                ));
                return Err(EngineError::RestartBudgetExhausted {
                    restarts,
                    window_secs,
                });
            }

            tracing::error!(
                alert = true,
                run = self.runs,
                restarts,
                error = %failure,
                "Engine run failed, restarting"
            );
            self.journal.record_health_event(HealthEvent::new(
                HealthEventKind::Restart,
                format!("run {} failed: {}", self.runs, failure),
            ));
            if let Some(mirror) = &self.mirror {
                if let Err(err) = mirror.record(now).await {
                    tracing::warn!(error = %err, "Failed to mirror restart to Redis");
                }
            }

            let delay = Duration::from_millis(self.settings.health.restart_delay_ms);
            if !self.shutdown.sleep(delay).await {
                return Ok(());
            }
        }
    }

    /// One engine run; the error is a description of why it ended
    async fn run_once(&self) -> Result<(), String> {
        let settings = &self.settings;
        let cache = Arc::new(Mutex::new(MarketDataCache::new(
            settings.cache.max_entries,
            settings.cache.max_age(),
        )));
        let (status_tx, health_rx) = watch::channel(HealthStatus::initial());

        let controller = HealthController::new(
            self.connector.clone(),
            cache.clone(),
            self.memory.clone(),
            self.heartbeat.clone(),
            settings.health.clone(),
            settings.exchange.call_timeout(),
            status_tx,
            self.journal.clone(),
        );
        let _health = AbortOnDrop(tokio::spawn(controller.run(self.shutdown.clone())));

        let ctx = OrchestratorContext::new(
            settings.clone(),
            self.connector.clone(),
            cache,
            self.ledger.clone(),
            health_rx,
            self.shutdown.clone(),
            self.journal.clone(),
        )
        .with_state(self.state.clone());
        let orchestrator = Orchestrator::new(ctx, (self.strategy_factory)());

        match tokio::spawn(orchestrator.run()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) if err.is_panic() => Err(format!("panic: {}", panic_message(err.into_panic()))),
            Err(err) => Err(err.to_string()),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
