use std::collections::HashSet;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::cache::CacheKey;
use crate::engine::{EngineState, OrchestratorContext};
use crate::error::{EngineError, ExchangeError};
use crate::exchange::with_timeout;
use crate::execution::{CloseRequest, ExecutionOutcome, OrderExecutor};
use crate::models::{
    Action, Balance, Decision, ExitReason, HealthEvent, HealthEventKind, MarketSnapshot,
};
use crate::risk::{BreakerTransition, RiskOutcome, RiskViolation};
use crate::strategy::Strategy;

/// What one cycle did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub entries: usize,
    pub closes: usize,
    pub rejections: usize,
    /// Symbols skipped because their data could not be fetched
    pub skipped: usize,
    /// False when the cycle ended early on a transient failure
    pub completed: bool,
}

/// The trading loop: fetch → decide → risk-check → execute → track → wait
///
/// Positions and risk state live in `ctx.state`; the lock is taken for each
/// synchronous step and released before any exchange call.
pub struct Orchestrator {
    ctx: OrchestratorContext,
    strategy: Box<dyn Strategy>,
    executor: OrderExecutor,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext, strategy: Box<dyn Strategy>) -> Self {
        let settings = &ctx.settings;
        let executor = OrderExecutor::new(
            ctx.connector.clone(),
            settings.execution.clone(),
            settings.exchange.call_timeout(),
        );

        Self {
            ctx,
            strategy,
            executor,
        }
    }

    /// Positions and risk state, locked
    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        self.ctx.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    fn call_timeout(&self) -> Duration {
        self.ctx.settings.exchange.call_timeout()
    }

    /// Loop until shutdown; a fatal error ends the run
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.startup().await?;

        while !self.ctx.shutdown.is_triggered() {
            let report = self.run_cycle().await?;
            tracing::debug!(?report, "Cycle finished");

            if !self.wait().await {
                break;
            }
        }

        self.drain();
        Ok(())
    }

    /// Refresh the session and look for exchange orders this run does not know
    pub async fn startup(&mut self) -> Result<(), EngineError> {
        let connector = self.ctx.connector.clone();
        let (carried, known): (usize, HashSet<String>) = {
            let state = self.state();
            for position in state.positions.positions() {
                tracing::info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    size = position.size,
                    stop_loss = position.stop_loss,
                    "Resuming position from previous run"
                );
            }
            let known = state
                .positions
                .positions()
                .flat_map(|p| p.protection.order_ids())
                .collect();
            (state.positions.count(), known)
        };
        tracing::info!(
            exchange = connector.name(),
            strategy = self.strategy.name(),
            symbols = ?self.ctx.settings.trading.symbols,
            carried_positions = carried,
            "Engine run starting"
        );

        match with_timeout(self.call_timeout(), connector.reconnect()).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => tracing::warn!(error = %err, "Session refresh failed, continuing"),
        }

        for symbol in &self.ctx.settings.trading.symbols {
            let orders = with_timeout(self.call_timeout(), connector.fetch_open_orders(symbol))
                .await
                .map(|orders| {
                    orders
                        .into_iter()
                        .filter(|o| !known.contains(&o.id))
                        .collect::<Vec<_>>()
                });
            match orders {
                Ok(orders) if !orders.is_empty() => tracing::warn!(
                    symbol = %symbol,
                    count = orders.len(),
                    ids = ?orders.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
                    "Open exchange orders not tracked by this run"
                ),
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => tracing::warn!(symbol = %symbol, error = %err, "Open order check failed"),
            }
        }
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let mut report = CycleReport::default();

        self.executor.resolve_pending().await?;

        let Some(mut balance) = self.fetch_balance().await? else {
            return Ok(report);
        };
        self.observe_equity(&balance);
        report.closes += self.reconcile_protection().await?;

        let health = self.ctx.health();
        if !health.allows_entries() {
            tracing::info!(verdict = ?health.verdict, issues = ?health.issues, "New entries paused");
        }

        let symbols = self.ctx.settings.trading.symbols.clone();
        for symbol in &symbols {
            let snapshot = match self.snapshot(symbol).await {
                Ok(snapshot) => snapshot,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(symbol = %symbol, error = %err, "Market data unavailable, skipping symbol");
                    report.skipped += 1;
                    continue;
                }
            };

            // Existing positions are managed regardless of breaker or health
            if let Some(price) = snapshot.last_price() {
                let requests = self.state().positions.update_price(symbol, price);
                for request in requests {
                    if self.close(request).await? {
                        report.closes += 1;
                    }
                }

                let moves = self.state().positions.stops_to_move(symbol);
                for update in moves {
                    let protection = self.executor.move_stop(&update).await?;
                    self.state().positions.set_protection(update.position_id, protection);
                }
            }

            if self.executor.has_pending_entry(symbol) {
                tracing::debug!(symbol = %symbol, "Entry still pending, not evaluating");
                continue;
            }

            let decision = if snapshot.bars.len() < self.strategy.warmup_bars() {
                Decision::hold(symbol.clone())
            } else {
                self.strategy.decide(&snapshot)
            };

            // Opposite signal exits the current position
            let exit = {
                let mut state = self.state();
                let reversing = state
                    .positions
                    .position_for(symbol)
                    .filter(|p| decision.action.side() == Some(p.side.opposite()))
                    .map(|p| p.id);
                reversing.map(|id| state.positions.request_close(id, ExitReason::Signal))
            };
            if let Some(request) = exit {
                if let Some(request) = request {
                    if self.close(request).await? {
                        report.closes += 1;
                    }
                }
                continue;
            }

            if decision.action == Action::Hold {
                continue;
            }
            if !health.allows_entries() || self.ctx.shutdown.is_triggered() {
                continue;
            }

            let outcome = {
                let state = self.state();
                state.risk.evaluate(&decision, &snapshot, &state.positions, &balance)
            };
            match outcome {
                RiskOutcome::Rejected(RiskViolation::Hold) => {}
                RiskOutcome::Rejected(violation) => {
                    tracing::info!(
                        symbol = %symbol,
                        action = ?decision.action,
                        reason = %violation,
                        "Risk rejected decision"
                    );
                    report.rejections += 1;
                }
                RiskOutcome::Approved(sized) => {
                    tracing::info!(
                        symbol = %symbol,
                        side = %sized.side,
                        size = sized.size,
                        stop_loss = sized.stop_loss,
                        take_profit = sized.take_profit,
                        risk = sized.risk_amount,
                        "Risk approved entry"
                    );

                    match self.executor.execute_entry(&sized).await? {
                        ExecutionOutcome::Filled(fill) | ExecutionOutcome::PartiallyFilled(fill) => {
                            let trailing = self.ctx.settings.execution.trailing_stop_distance;
                            self.state().positions.open(&sized, &fill, trailing);
                            report.entries += 1;

                            if let Some(updated) = self.fetch_balance().await? {
                                balance = updated;
                            }
                        }
                        ExecutionOutcome::Unfilled => {
                            tracing::info!(symbol = %symbol, "Entry expired unfilled");
                        }
                        ExecutionOutcome::Rejected(reason) => {
                            tracing::info!(symbol = %symbol, reason = %reason, "Entry rejected");
                            report.rejections += 1;
                        }
                    }
                }
            }
        }

        report.completed = true;
        self.ctx.mark_cycle(Utc::now());
        Ok(report)
    }

    /// Sleep until the next cycle; false if shutdown interrupted the wait
    pub async fn wait(&self) -> bool {
        let trading = &self.ctx.settings.trading;
        let delay = match trading.cycle_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let now = Utc::now();
                let next = trading.timeframe.next_close_after(now)
                    + chrono::Duration::seconds(trading.settle_delay_secs as i64);
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        };

        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting for next cycle");
        self.ctx.shutdown.sleep(delay).await
    }

    /// Log what is left behind; protective orders stay on the exchange
    fn drain(&self) {
        let state = self.state();
        for position in state.positions.positions() {
            tracing::info!(
                position_id = %position.id,
                symbol = %position.symbol,
                size = position.size,
                stop_loss = position.stop_loss,
                protected = !position.protection.is_empty(),
                "Position left open at shutdown"
            );
        }
        tracing::info!(
            realized_pnl = state.positions.realized_total(),
            "Engine run stopped"
        );
    }

    /// Balance, or None when a transient failure means skipping this cycle
    async fn fetch_balance(&self) -> Result<Option<Balance>, EngineError> {
        match with_timeout(self.call_timeout(), self.ctx.connector.fetch_balance()).await {
            Ok(balance) => Ok(Some(balance)),
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "Balance unavailable, skipping cycle");
                Ok(None)
            }
        }
    }

    fn observe_equity(&self, balance: &Balance) {
        let transitions = {
            let mut state = self.state();
            tracing::debug!(
                equity = balance.total,
                marked = state.positions.equity(balance),
                open_risk = state.positions.open_risk(),
                positions = state.positions.count(),
                "Portfolio"
            );
            state.risk.observe_equity(balance.total, Utc::now())
        };
        for transition in transitions {
            match transition {
                BreakerTransition::Tripped(trip) => {
                    tracing::error!(
                        alert = true,
                        kind = ?trip.kind,
                        value = trip.value,
                        equity = balance.total,
                        "Circuit breaker tripped, new entries halted"
                    );
                    self.ctx.journal.record_health_event(HealthEvent::new(
                        HealthEventKind::CircuitBreakerTripped,
                        format!("{:?} at {:.4}", trip.kind, trip.value),
                    ));
                }
                BreakerTransition::Reset(trip) => {
                    tracing::info!(kind = ?trip.kind, value = trip.value, "Circuit breaker reset");
                    self.ctx.journal.record_health_event(HealthEvent::new(
                        HealthEventKind::CircuitBreakerReset,
                        format!("{:?} at {:.4}", trip.kind, trip.value),
                    ));
                }
            }
        }
    }

    /// Close positions whose protective orders the exchange already filled
    async fn reconcile_protection(&mut self) -> Result<usize, EngineError> {
        let tracked: Vec<(String, String)> = self
            .state()
            .positions
            .positions()
            .flat_map(|p| {
                p.protection
                    .order_ids()
                    .into_iter()
                    .map(|id| (p.symbol.clone(), id))
                    .collect::<Vec<_>>()
            })
            .collect();
        if tracked.is_empty() {
            return Ok(0);
        }

        let mut reports = Vec::with_capacity(tracked.len());
        for (symbol, id) in &tracked {
            match with_timeout(self.call_timeout(), self.ctx.connector.fetch_order(symbol, id)).await {
                Ok(ack) => reports.push(ack),
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => tracing::warn!(order_id = %id, error = %err, "Protective order status unavailable"),
            }
        }

        let closes = self.state().positions.reconcile(&reports);
        for close in &closes {
            self.executor
                .cancel_stale(&close.record.symbol, &close.stale_order_ids)
                .await?;
            self.ctx.journal.record_trade(close.record.clone());
        }
        Ok(closes.len())
    }

    /// Hand a close to the executor; true once the position is gone
    async fn close(&mut self, request: CloseRequest) -> Result<bool, EngineError> {
        let report = self.executor.close_position(&request).await?;
        let record = self.state().positions.finish_close(request.position_id, &report);
        match record {
            Some(record) => {
                self.ctx.journal.record_trade(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cached snapshot if fresh enough, otherwise fetch and cache
    async fn snapshot(&self, symbol: &str) -> Result<Arc<MarketSnapshot>, ExchangeError> {
        let trading = &self.ctx.settings.trading;
        let key = CacheKey::new(symbol, trading.timeframe);
        let max_age = self.ctx.settings.cache.max_age();

        let cached = self
            .ctx
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key, max_age);
        if let Some(snapshot) = cached {
            return Ok(snapshot);
        }

        let snapshot = with_timeout(
            self.call_timeout(),
            self.ctx
                .connector
                .fetch_ohlcv(symbol, trading.timeframe, trading.candle_limit),
        )
        .await?;

        let mut cache = self.ctx.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put(key.clone(), snapshot.clone());
        Ok(cache.get(&key, max_age).unwrap_or_else(|| Arc::new(snapshot)))
    }
}
