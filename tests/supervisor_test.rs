mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_test::assert_ok;

use common::settings;
use tradeloop::config::Settings;
use tradeloop::engine::{run_engine, ShutdownSignal, Supervisor};
use tradeloop::exchange::{ExchangeConnector, PaperExchange, PaperOp};
use tradeloop::health::{FixedMemory, RestartLedger};
use tradeloop::persistence::{spawn_writer, MemoryJournal};
use tradeloop::{Action, Decision, EngineError, ExchangeError, HealthEventKind, MarketSnapshot, Strategy};

fn build_supervisor(
    config: Settings,
    exchange: Arc<PaperExchange>,
    shutdown: ShutdownSignal,
    journal: Arc<MemoryJournal>,
) -> (Supervisor, tokio::task::JoinHandle<()>) {
    let ledger = RestartLedger::from_settings(&config.health);
    let (handle, writer) = spawn_writer(journal, 64);
    let connector: Arc<dyn ExchangeConnector> = exchange;
    let supervisor = Supervisor::new(
        Arc::new(config),
        connector,
        ledger,
        shutdown,
        handle,
        Arc::new(FixedMemory::new(0.1)),
    );
    (supervisor, writer)
}

type Step = Arc<dyn Fn(usize, &MarketSnapshot) -> Decision + Send + Sync>;

/// Decides by call number, counted across engine runs
struct Stepped {
    calls: Arc<AtomicUsize>,
    step: Step,
}

impl Strategy for Stepped {
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.step)(call, snapshot)
    }

    fn name(&self) -> &str {
        "stepped"
    }

    fn warmup_bars(&self) -> usize {
        0
    }
}

fn stepped(
    supervisor: Supervisor,
    step: impl Fn(usize, &MarketSnapshot) -> Decision + Send + Sync + 'static,
) -> Supervisor {
    let calls = Arc::new(AtomicUsize::new(0));
    let step: Step = Arc::new(step);
    supervisor.with_strategy_factory(move || {
        Box::new(Stepped {
            calls: calls.clone(),
            step: step.clone(),
        }) as Box<dyn Strategy>
    })
}

fn buy(snapshot: &MarketSnapshot, stop_distance: f64, take_profit_distance: f64) -> Decision {
    Decision::new(snapshot.symbol.clone(), Action::Buy, 1.0)
        .with_stops(stop_distance, take_profit_distance)
}

/// Panics on its first decision, then stops the engine on the next one
struct PanicsOnce {
    calls: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
}

impl Strategy for PanicsOnce {
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("strategy blew up");
        }
        self.shutdown.trigger();
        Decision::hold(snapshot.symbol.clone())
    }

    fn name(&self) -> &str {
        "panics_once"
    }

    fn warmup_bars(&self) -> usize {
        0
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_budget_exhaustion_halts() {
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.fail_times(PaperOp::Reconnect, 10, ExchangeError::Auth("bad key".into()));
    let journal = Arc::new(MemoryJournal::new());
    let (mut supervisor, writer) = build_supervisor(
        settings(&["BTCUSDT"]),
        exchange.clone(),
        ShutdownSignal::new(),
        journal.clone(),
    );

    let result = supervisor.run().await;
    assert!(matches!(
        result,
        Err(EngineError::RestartBudgetExhausted {
            restarts: 5,
            window_secs: 3_600
        })
    ));
    assert_eq!(supervisor.runs(), 6);
    assert_eq!(exchange.calls(PaperOp::Reconnect), 6);
    assert_eq!(supervisor.ledger().lock().unwrap().timestamps().count(), 5);

    drop(supervisor);
    writer.await.unwrap();
    let kinds: Vec<HealthEventKind> = journal.health_events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == HealthEventKind::Restart).count(),
        5
    );
    assert_eq!(kinds.last(), Some(&HealthEventKind::RestartBudgetExhausted));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_run_is_restarted() {
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.set_price("BTCUSDT", 1_000.0);
    let shutdown = ShutdownSignal::new();
    let journal = Arc::new(MemoryJournal::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let (supervisor, writer) = build_supervisor(
        settings(&["BTCUSDT"]),
        exchange,
        shutdown.clone(),
        journal.clone(),
    );
    let factory_calls = calls.clone();
    let mut supervisor = supervisor.with_strategy_factory(move || {
        Box::new(PanicsOnce {
            calls: factory_calls.clone(),
            shutdown: shutdown.clone(),
        }) as Box<dyn Strategy>
    });

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.ledger().lock().unwrap().timestamps().count(), 1);

    drop(supervisor);
    writer.await.unwrap();
    let restarts: Vec<_> = journal
        .health_events()
        .into_iter()
        .filter(|e| e.kind == HealthEventKind::Restart)
        .collect();
    assert_eq!(restarts.len(), 1);
    assert!(restarts[0].detail.contains("panic: strategy blew up"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_start_runs_once() {
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();
    let (mut supervisor, _writer) = build_supervisor(
        settings(&["BTCUSDT"]),
        exchange.clone(),
        shutdown,
        Arc::new(MemoryJournal::new()),
    );

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 1);
    assert_eq!(exchange.calls(PaperOp::FetchBalance), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_during_shutdown_is_not_restarted() {
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.fail_times(PaperOp::Reconnect, 10, ExchangeError::Auth("bad key".into()));
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();
    let (mut supervisor, _writer) = build_supervisor(
        settings(&["BTCUSDT"]),
        exchange,
        shutdown,
        Arc::new(MemoryJournal::new()),
    );

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 1);
    assert!(supervisor.ledger().lock().unwrap().timestamps().next().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_run_engine_with_paper_defaults() {
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();

    assert_ok!(run_engine(settings(&["BTCUSDT"]), shutdown, None).await);
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_open_positions() {
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.set_price("BTCUSDT", 1_000.0);
    let shutdown = ShutdownSignal::new();
    let (supervisor, _writer) = build_supervisor(
        settings(&["BTCUSDT"]),
        exchange.clone(),
        shutdown.clone(),
        Arc::new(MemoryJournal::new()),
    );

    let failing = exchange.clone();
    let mut supervisor = stepped(supervisor, move |call, snapshot| {
        match call {
            // Next cycle's balance fetch ends the run
            2 => failing.fail_next(PaperOp::FetchBalance, ExchangeError::Auth("expired".into())),
            4 => shutdown.trigger(),
            _ => {}
        }
        buy(snapshot, 50.0, 100.0)
    });

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 2);
    assert!(common::approx(exchange.holdings("BTCUSDT"), 2.0));
    // Entry plus its two protective orders, nothing from the second run
    assert_eq!(exchange.orders().len(), 3);

    let state = supervisor.state();
    let state = state.lock().unwrap();
    assert_eq!(state.positions.count(), 1);
    assert!(!state.positions.position_for("BTCUSDT").unwrap().protection.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tripped_breaker_survives_restart() {
    let mut config = settings(&["BTCUSDT", "ETHUSDT"]);
    config.risk.max_portfolio_drawdown = 0.005;
    config.risk.drawdown_recovery_threshold = 0.003;
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.set_price("BTCUSDT", 1_000.0);
    exchange.set_price("ETHUSDT", 100.0);
    let shutdown = ShutdownSignal::new();
    let (supervisor, _writer) =
        build_supervisor(config, exchange.clone(), shutdown.clone(), Arc::new(MemoryJournal::new()));

    let market = exchange.clone();
    // Calls alternate BTCUSDT, ETHUSDT each cycle
    let mut supervisor = stepped(supervisor, move |call, snapshot| {
        match (call, snapshot.symbol.as_str()) {
            (1, _) => buy(snapshot, 50.0, 100.0),
            (2, _) => {
                // Equity 9920 on the next balance: 0.8% below the peak
                market.set_price("BTCUSDT", 960.0);
                Decision::hold(snapshot.symbol.clone())
            }
            (4, _) => {
                market.fail_next(PaperOp::FetchBalance, ExchangeError::Auth("expired".into()));
                buy(snapshot, 5.0, 10.0)
            }
            (8, _) => {
                shutdown.trigger();
                Decision::hold(snapshot.symbol.clone())
            }
            (_, "ETHUSDT") => buy(snapshot, 5.0, 10.0),
            _ => Decision::hold(snapshot.symbol.clone()),
        }
    });

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 2);
    assert_eq!(exchange.holdings("ETHUSDT"), 0.0);
    assert!(common::approx(exchange.holdings("BTCUSDT"), 2.0));

    let state = supervisor.state();
    let state = state.lock().unwrap();
    assert!(state.risk.breaker().is_tripped());
    assert_eq!(state.positions.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_pauses_entries_then_resumes_without_restart() {
    let mut config = settings(&["BTCUSDT"]);
    config.trading.cycle_interval_secs = Some(4);
    let exchange = Arc::new(PaperExchange::new(common::BALANCE, "USDT"));
    exchange.set_price("BTCUSDT", 1_000.0);
    let shutdown = ShutdownSignal::new();
    let journal = Arc::new(MemoryJournal::new());
    let (supervisor, writer) = build_supervisor(config, exchange.clone(), shutdown.clone(), journal.clone());

    // Orders on the exchange at each buy decision
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let market = exchange.clone();
    let record = seen.clone();
    let mut supervisor = stepped(supervisor, move |call, snapshot| {
        if call == 3 {
            // Fails the 30s health check and the first two pings after reconnecting
            market.fail_times(PaperOp::Ping, 3, ExchangeError::Transient("connection reset".into()));
        }
        if market.holdings("BTCUSDT") > 0.0 {
            shutdown.trigger();
        }
        if market.calls(PaperOp::Ping) < 2 {
            return Decision::hold(snapshot.symbol.clone());
        }
        record.lock().unwrap().push(market.orders().len());
        buy(snapshot, 50.0, 100.0)
    });

    assert_ok!(supervisor.run().await);
    assert_eq!(supervisor.runs(), 1);
    assert_eq!(supervisor.ledger().lock().unwrap().timestamps().count(), 0);

    // Buys at 32s and 36s fall inside the reconnect window, the one at 40s fills
    let seen = seen.lock().unwrap().clone();
    assert!(seen.len() >= 3);
    assert_eq!(&seen[..2], &[0, 0]);
    assert!(seen.last().copied().unwrap_or(0) > 0);
    assert!(common::approx(exchange.holdings("BTCUSDT"), 2.0));
    // One reconnect at startup, three from the health loop
    assert_eq!(exchange.calls(PaperOp::Reconnect), 4);

    drop(supervisor);
    writer.await.unwrap();
    let kinds: Vec<HealthEventKind> = journal.health_events().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&HealthEventKind::ConnectivityLost));
    assert!(kinds.contains(&HealthEventKind::Reconnected));
    assert!(!kinds.contains(&HealthEventKind::Restart));
}
