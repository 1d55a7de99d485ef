#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tradeloop::cache::MarketDataCache;
use tradeloop::config::Settings;
use tradeloop::engine::{CycleReport, Orchestrator, OrchestratorContext, ShutdownSignal};
use tradeloop::exchange::{ExchangeConnector, PaperExchange};
use tradeloop::health::{HealthStatus, HealthVerdict, RestartLedger};
use tradeloop::persistence::{spawn_writer, JournalHandle, MemoryJournal};
use tradeloop::{Action, Decision, MarketSnapshot, Strategy};

pub const BALANCE: f64 = 10_000.0;

/// Settings for engine tests: paper exchange, fixed one-minute cycles
pub fn settings(symbols: &[&str]) -> Settings {
    let mut settings = Settings::default();
    settings.trading.symbols = symbols.iter().map(|s| s.to_string()).collect();
    settings.trading.cycle_interval_secs = Some(60);
    settings.trading.initial_balance = BALANCE;
    settings.execution.fill_timeout_secs = 2;
    settings.execution.poll_interval_ms = 100;
    settings.health.restart_delay_ms = 10;
    settings
}

/// Decisions per symbol, changed by the test between cycles
#[derive(Clone, Default)]
pub struct Script {
    decisions: Arc<Mutex<HashMap<String, Decision>>>,
}

impl Script {
    pub fn buy(&self, symbol: &str, stop_distance: f64, take_profit_distance: f64) {
        self.set(
            Decision::new(symbol, Action::Buy, 1.0).with_stops(stop_distance, take_profit_distance),
        );
    }

    pub fn sell(&self, symbol: &str) {
        self.set(Decision::new(symbol, Action::Sell, 1.0));
    }

    pub fn hold(&self, symbol: &str) {
        self.decisions.lock().unwrap().remove(symbol);
    }

    fn set(&self, decision: Decision) {
        self.decisions
            .lock()
            .unwrap()
            .insert(decision.symbol.clone(), decision);
    }
}

pub struct ScriptedStrategy(pub Script);

impl Strategy for ScriptedStrategy {
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        self.0
            .decisions
            .lock()
            .unwrap()
            .get(&snapshot.symbol)
            .cloned()
            .unwrap_or_else(|| Decision::hold(snapshot.symbol.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn warmup_bars(&self) -> usize {
        0
    }
}

/// An orchestrator over a paper exchange, with every port observable
pub struct Harness {
    pub exchange: Arc<PaperExchange>,
    pub journal: Arc<MemoryJournal>,
    pub script: Script,
    pub health_tx: watch::Sender<HealthStatus>,
    pub shutdown: ShutdownSignal,
    pub orchestrator: Orchestrator,
    pub writer: JoinHandle<()>,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let exchange = Arc::new(PaperExchange::new(BALANCE, "USDT"));
        Self::with_exchange(settings, exchange)
    }

    pub fn with_exchange(settings: Settings, exchange: Arc<PaperExchange>) -> Self {
        let journal = Arc::new(MemoryJournal::new());
        let (handle, writer) = spawn_writer(journal.clone(), 64);
        let (health_tx, health_rx) = watch::channel(HealthStatus::initial());
        let shutdown = ShutdownSignal::new();
        let script = Script::default();

        let ctx = context(settings, exchange.clone(), health_rx, shutdown.clone(), handle);
        let orchestrator = Orchestrator::new(ctx, Box::new(ScriptedStrategy(script.clone())));

        Self {
            exchange,
            journal,
            script,
            health_tx,
            shutdown,
            orchestrator,
            writer,
        }
    }

    /// Let cached snapshots expire, then run one cycle
    pub async fn cycle(&mut self) -> CycleReport {
        tokio::time::advance(Duration::from_secs(61)).await;
        self.orchestrator
            .run_cycle()
            .await
            .expect("cycle should not fail")
    }

    pub fn set_verdict(&self, verdict: HealthVerdict) {
        self.health_tx.send_replace(HealthStatus {
            verdict,
            ..HealthStatus::initial()
        });
    }

    /// Give the journal writer a chance to catch up
    pub async fn flush(&self) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn context(
    settings: Settings,
    exchange: Arc<PaperExchange>,
    health_rx: watch::Receiver<HealthStatus>,
    shutdown: ShutdownSignal,
    journal: JournalHandle,
) -> OrchestratorContext {
    let connector: Arc<dyn ExchangeConnector> = exchange;
    let cache = Arc::new(Mutex::new(MarketDataCache::new(
        settings.cache.max_entries,
        settings.cache.max_age(),
    )));
    let ledger = Arc::new(Mutex::new(RestartLedger::from_settings(&settings.health)));
    OrchestratorContext::new(
        Arc::new(settings),
        connector,
        cache,
        ledger,
        health_rx,
        shutdown,
        journal,
    )
}

pub fn approx(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-6
}
