use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ExecutionSettings;
use crate::error::{EngineError, ExchangeError};
use crate::exchange::{with_timeout, ExchangeConnector, ExchangeOrderStatus, OrderAck};
use crate::execution::order::{Order, OrderRole, OrderState};
use crate::execution::position_tracker::{CloseRequest, Protection, StopUpdate};
use crate::models::{OrderKind, Side};
use crate::risk::SizedOrder;

const HISTORY_LIMIT: usize = 256;

/// Executed quantity of one order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub client_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub role: OrderRole,
    /// Protective orders placed for this fill (entries only)
    pub protection: Protection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(Fill),
    /// Remainder was cancelled at the fill timeout
    PartiallyFilled(Fill),
    Unfilled,
    Rejected(String),
}

/// Result of closing a position
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    pub outcome: ExecutionOutcome,
    /// Protection re-placed for whatever size is still open
    pub replacement: Protection,
}

/// An order whose final state could not be confirmed
struct Unresolved {
    order: Order,
    reported_fill: f64,
}

/// Submits orders and drives them to a terminal state
///
/// Every submission carries a client id that is reused on retries, so the
/// exchange sees at most one order per intent.
pub struct OrderExecutor {
    connector: Arc<dyn ExchangeConnector>,
    settings: ExecutionSettings,
    call_timeout: Duration,
    pending_entries: HashSet<String>,
    unresolved: HashMap<String, Unresolved>,
    history: VecDeque<Order>,
}

impl OrderExecutor {
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        settings: ExecutionSettings,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            settings,
            call_timeout,
            pending_entries: HashSet::new(),
            unresolved: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Whether an entry for `symbol` is still in flight or unconfirmed
    pub fn has_pending_entry(&self, symbol: &str) -> bool {
        self.pending_entries.contains(symbol) || self.unresolved.contains_key(symbol)
    }

    /// Recently finished orders, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Order> {
        self.history.iter()
    }

    fn next_client_id(&self) -> String {
        format!("{}-{}", self.settings.client_id_prefix, Uuid::new_v4().simple())
    }

    /// Submit an approved entry, wait for it to fill, then protect it
    pub async fn execute_entry(&mut self, sized: &SizedOrder) -> Result<ExecutionOutcome, EngineError> {
        if self.has_pending_entry(&sized.symbol) {
            return Ok(ExecutionOutcome::Rejected(format!(
                "entry already pending for {}",
                sized.symbol
            )));
        }

        self.pending_entries.insert(sized.symbol.clone());
        let result = self.run_entry(sized).await;
        self.pending_entries.remove(&sized.symbol);
        result
    }

    async fn run_entry(&mut self, sized: &SizedOrder) -> Result<ExecutionOutcome, EngineError> {
        let mut order = Order::new(
            self.next_client_id(),
            &sized.symbol,
            sized.side,
            OrderKind::Market,
            OrderRole::Entry,
            sized.size,
        );

        tracing::info!(
            client_id = %order.client_id,
            symbol = %sized.symbol,
            side = %sized.side,
            size = sized.size,
            price = sized.entry_price,
            "Submitting entry"
        );

        if let Some(reason) = self.submit(&mut order).await? {
            self.archive(order);
            return Ok(ExecutionOutcome::Rejected(reason));
        }
        self.drive_to_completion(&mut order).await?;

        let outcome = match fill_of(&order, sized.entry_price) {
            None if order.state == OrderState::Rejected => {
                ExecutionOutcome::Rejected("rejected by exchange".to_string())
            }
            None => ExecutionOutcome::Unfilled,
            Some(mut fill) => {
                fill.protection = self
                    .protect(&sized.symbol, sized.side, fill.size, sized.stop_loss, sized.take_profit)
                    .await?;
                if order.state == OrderState::Filled {
                    ExecutionOutcome::Filled(fill)
                } else {
                    ExecutionOutcome::PartiallyFilled(fill)
                }
            }
        };

        let reported = order.filled_size;
        self.finish(order, reported);
        Ok(outcome)
    }

    /// Cancel a position's protection and exit it at market
    pub async fn close_position(&mut self, request: &CloseRequest) -> Result<CloseReport, EngineError> {
        let protective_ids = request.protection.order_ids();

        for id in &protective_ids {
            match with_timeout(self.call_timeout, self.connector.cancel_order(&request.symbol, id)).await {
                Ok(()) | Err(ExchangeError::NotFound(_)) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(ExchangeError::Rejected(_)) => {
                    // Not open any more: the exchange may have closed us already
                    if let Some(report) = self.protective_fill(request, id, &protective_ids).await? {
                        return Ok(report);
                    }
                }
                Err(err) => {
                    tracing::warn!(order_id = %id, error = %err, "Failed to cancel protective order");
                }
            }
        }

        let mut order = Order::new(
            self.next_client_id(),
            &request.symbol,
            request.side.opposite(),
            OrderKind::Market,
            OrderRole::Exit,
            request.size,
        );

        if let Some(reason) = self.submit(&mut order).await? {
            self.archive(order);
            let replacement = self
                .protect(&request.symbol, request.side, request.size, request.stop_loss, request.take_profit)
                .await?;
            return Ok(CloseReport {
                outcome: ExecutionOutcome::Rejected(reason),
                replacement,
            });
        }
        self.drive_to_completion(&mut order).await?;

        let reference = order.avg_fill_price.unwrap_or(request.stop_loss);
        let fill = fill_of(&order, reference);
        let filled = fill.as_ref().map_or(0.0, |f| f.size);
        let remaining = request.size - filled;
        let replacement = if remaining > f64::EPSILON * request.size.max(1.0) {
            self.protect(&request.symbol, request.side, remaining, request.stop_loss, request.take_profit)
                .await?
        } else {
            Protection::default()
        };

        let outcome = match fill {
            None => ExecutionOutcome::Unfilled,
            Some(fill) if order.state == OrderState::Filled => ExecutionOutcome::Filled(fill),
            Some(fill) => ExecutionOutcome::PartiallyFilled(fill),
        };

        self.finish(order, filled);
        Ok(CloseReport {
            outcome,
            replacement,
        })
    }

    /// Replace the resting stop with one at the trailed price
    ///
    /// Returns the protection now on the exchange. If the old stop cannot be
    /// cancelled it is left alone and the move is retried on a later cycle.
    pub async fn move_stop(&mut self, update: &StopUpdate) -> Result<Protection, EngineError> {
        let current = &update.protection;
        let Some(old_id) = current.bracket_id.clone().or_else(|| current.stop_loss_id.clone()) else {
            return Ok(current.clone());
        };

        match with_timeout(self.call_timeout, self.connector.cancel_order(&update.symbol, &old_id)).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                // Filled or gone orders are picked up by reconciliation
                tracing::warn!(order_id = %old_id, error = %err, "Could not cancel stop for trailing move");
                return Ok(current.clone());
            }
        }

        let exit_side = update.side.opposite();
        let mut protection = current.clone();
        if current.bracket_id.is_some() {
            let bracket = Order::new(self.next_client_id(), &update.symbol, exit_side, OrderKind::Stop, OrderRole::Bracket, update.size)
                .with_prices(None, Some(update.stop_loss), Some(update.take_profit));
            protection.bracket_id = self.place_protective(bracket).await?;
        } else {
            let stop = Order::new(self.next_client_id(), &update.symbol, exit_side, OrderKind::Stop, OrderRole::StopLoss, update.size)
                .with_prices(None, Some(update.stop_loss), None);
            protection.stop_loss_id = self.place_protective(stop).await?;
        }

        if protection.stop_loss_id.is_none() && protection.bracket_id.is_none() {
            protection.stop_price = None;
            tracing::error!(
                alert = true,
                symbol = %update.symbol,
                "Trailing stop not re-placed, monitoring stop locally"
            );
        } else {
            tracing::info!(
                symbol = %update.symbol,
                from = ?current.stop_price,
                to = update.stop_loss,
                "Exchange stop moved"
            );
            protection.stop_price = Some(update.stop_loss);
        }
        Ok(protection)
    }

    /// Cancel protective orders left behind after the exchange closed a position
    pub async fn cancel_stale(&mut self, symbol: &str, order_ids: &[String]) -> Result<(), EngineError> {
        for id in order_ids {
            match with_timeout(self.call_timeout, self.connector.cancel_order(symbol, id)).await {
                Ok(()) | Err(ExchangeError::NotFound(_)) | Err(ExchangeError::Rejected(_)) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => tracing::warn!(order_id = %id, error = %err, "Failed to cancel stale order"),
            }
        }
        Ok(())
    }

    /// Retry confirming orders whose cancel could not be confirmed earlier
    pub async fn resolve_pending(&mut self) -> Result<(), EngineError> {
        let symbols: Vec<String> = self.unresolved.keys().cloned().collect();

        for symbol in symbols {
            let Some(mut entry) = self.unresolved.remove(&symbol) else {
                continue;
            };
            if let Some(id) = entry.order.id.clone() {
                self.cancel_remainder(&mut entry.order, &id).await?;
            }

            if !entry.order.is_terminal() {
                self.unresolved.insert(symbol, entry);
                continue;
            }

            let extra = entry.order.filled_size - entry.reported_fill;
            if extra > f64::EPSILON {
                tracing::error!(
                    alert = true,
                    symbol = %symbol,
                    client_id = %entry.order.client_id,
                    untracked = extra,
                    "Order filled after it was reported, exposure not tracked"
                );
            } else {
                tracing::info!(symbol = %symbol, client_id = %entry.order.client_id, "Pending order resolved");
            }
            self.archive(entry.order);
        }
        Ok(())
    }

    /// Submit with the same client id until acknowledged
    ///
    /// Returns the rejection reason, or None once the exchange accepted it.
    async fn submit(&mut self, order: &mut Order) -> Result<Option<String>, EngineError> {
        let request = order.to_request();
        let mut attempt: u32 = 0;

        loop {
            match with_timeout(self.call_timeout, self.connector.create_order(&request)).await {
                Ok(ack) => {
                    order.apply_ack(&ack)?;
                    return Ok(None);
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) if err.is_transient() && attempt < self.settings.max_submit_retries => {
                    attempt += 1;
                    let backoff = self
                        .settings
                        .poll_interval()
                        .saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        client_id = %order.client_id,
                        error = %err,
                        attempt,
                        "Order submission failed, retrying in {}ms",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) if err.is_transient() => {
                    // The last attempt may still have reached the exchange
                    if let Some(ack) = self.lookup_open(&order.symbol, &order.client_id).await {
                        order.apply_ack(&ack)?;
                        return Ok(None);
                    }
                    order.transition(OrderState::Rejected)?;
                    tracing::warn!(client_id = %order.client_id, error = %err, "Order submission gave up");
                    return Ok(Some(format!("submission failed: {}", err)));
                }
                Err(err) => {
                    order.transition(OrderState::Rejected)?;
                    tracing::info!(
                        client_id = %order.client_id,
                        symbol = %order.symbol,
                        reason = %err,
                        "Order rejected"
                    );
                    return Ok(Some(err.to_string()));
                }
            }
        }
    }

    async fn lookup_open(&self, symbol: &str, client_id: &str) -> Option<OrderAck> {
        with_timeout(self.call_timeout, self.connector.fetch_open_orders(symbol))
            .await
            .ok()?
            .into_iter()
            .find(|ack| ack.client_id == client_id)
    }

    /// Poll until terminal or the fill timeout, then cancel any remainder
    async fn drive_to_completion(&mut self, order: &mut Order) -> Result<(), EngineError> {
        let Some(id) = order.id.clone() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.settings.fill_timeout();

        while !order.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval().min(deadline - now)).await;

            match with_timeout(self.call_timeout, self.connector.fetch_order(&order.symbol, &id)).await {
                Ok(ack) => order.apply_ack(&ack)?,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => tracing::warn!(order_id = %id, error = %err, "Order status poll failed"),
            }
        }

        if order.is_terminal() {
            return Ok(());
        }

        tracing::info!(
            order_id = %id,
            filled = order.filled_size,
            requested = order.requested_size,
            "Fill timeout, cancelling remainder"
        );
        self.cancel_remainder(order, &id).await
    }

    async fn cancel_remainder(&mut self, order: &mut Order, id: &str) -> Result<(), EngineError> {
        let cancelled = match with_timeout(self.call_timeout, self.connector.cancel_order(&order.symbol, id)).await {
            Ok(()) => true,
            Err(ExchangeError::NotFound(_)) => {
                order.transition(OrderState::Cancelled)?;
                return Ok(());
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            // Refused: already done on the exchange side, refresh below
            Err(ExchangeError::Rejected(_)) => false,
            Err(err) => {
                tracing::warn!(order_id = %id, error = %err, "Cancel failed, order unresolved");
                return Ok(());
            }
        };

        // Capture fills that landed before the cancel
        match with_timeout(self.call_timeout, self.connector.fetch_order(&order.symbol, id)).await {
            Ok(ack) if OrderState::from(ack.status).is_terminal() => order.apply_ack(&ack)?,
            Ok(ack) if cancelled => {
                order.apply_ack(&ack)?;
                order.transition(OrderState::Cancelled)?;
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            _ if cancelled => order.transition(OrderState::Cancelled)?,
            _ => {}
        }
        Ok(())
    }

    /// Place stop-loss and take-profit for `size` of a `side` position
    ///
    /// Uses one OCO order when the exchange supports it, otherwise two
    /// independent orders. Failure leaves the position to local monitoring.
    async fn protect(
        &mut self,
        symbol: &str,
        side: Side,
        size: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Protection, EngineError> {
        let exit_side = side.opposite();
        let mut protection = Protection::default();

        if self.connector.supports_conditional_orders() {
            let bracket = Order::new(self.next_client_id(), symbol, exit_side, OrderKind::Stop, OrderRole::Bracket, size)
                .with_prices(None, Some(stop_loss), Some(take_profit));
            protection.bracket_id = self.place_protective(bracket).await?;
        } else {
            let stop = Order::new(self.next_client_id(), symbol, exit_side, OrderKind::Stop, OrderRole::StopLoss, size)
                .with_prices(None, Some(stop_loss), None);
            protection.stop_loss_id = self.place_protective(stop).await?;

            let target = Order::new(self.next_client_id(), symbol, exit_side, OrderKind::Limit, OrderRole::TakeProfit, size)
                .with_prices(Some(take_profit), None, None);
            protection.take_profit_id = self.place_protective(target).await?;
        }

        if protection.stop_loss_id.is_some() || protection.bracket_id.is_some() {
            protection.stop_price = Some(stop_loss);
        }
        if protection.is_empty() {
            tracing::error!(
                alert = true,
                symbol = %symbol,
                "Position unprotected on exchange, monitoring stops locally"
            );
        } else {
            tracing::info!(symbol = %symbol, size, stop_loss, take_profit, "Protection placed");
        }
        Ok(protection)
    }

    async fn place_protective(&mut self, mut order: Order) -> Result<Option<String>, EngineError> {
        let rejected = self.submit(&mut order).await?;
        let id = order.id.clone();
        self.archive(order);

        match rejected {
            None => Ok(id),
            Some(reason) => {
                tracing::warn!(reason = %reason, "Protective order refused");
                Ok(None)
            }
        }
    }

    /// Close report for a protective order the exchange already filled
    async fn protective_fill(
        &mut self,
        request: &CloseRequest,
        id: &str,
        all_ids: &[String],
    ) -> Result<Option<CloseReport>, EngineError> {
        let ack = match with_timeout(self.call_timeout, self.connector.fetch_order(&request.symbol, id)).await {
            Ok(ack) => ack,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(_) => return Ok(None),
        };
        if ack.status != ExchangeOrderStatus::Filled {
            return Ok(None);
        }

        let siblings: Vec<String> = all_ids.iter().filter(|other| *other != id).cloned().collect();
        self.cancel_stale(&request.symbol, &siblings).await?;

        let role = if request.protection.stop_loss_id.as_deref() == Some(id) {
            OrderRole::StopLoss
        } else if request.protection.take_profit_id.as_deref() == Some(id) {
            OrderRole::TakeProfit
        } else {
            OrderRole::Bracket
        };
        let fill = Fill {
            client_id: ack.client_id.clone(),
            order_id: ack.id.clone(),
            symbol: ack.symbol.clone(),
            side: ack.side,
            size: ack.filled_size.min(request.size),
            avg_price: ack.avg_fill_price.or(ack.stop_price).unwrap_or(request.stop_loss),
            role,
            protection: Protection::default(),
        };

        tracing::info!(order_id = %id, "Protective order already filled");
        let outcome = if fill.size + f64::EPSILON >= request.size {
            ExecutionOutcome::Filled(fill)
        } else {
            ExecutionOutcome::PartiallyFilled(fill)
        };
        Ok(Some(CloseReport {
            outcome,
            replacement: Protection::default(),
        }))
    }

    fn finish(&mut self, order: Order, reported_fill: f64) {
        if order.is_terminal() {
            self.archive(order);
            return;
        }

        tracing::error!(
            alert = true,
            symbol = %order.symbol,
            client_id = %order.client_id,
            "Order state unconfirmed, blocking entries for symbol"
        );
        self.unresolved.insert(
            order.symbol.clone(),
            Unresolved {
                order,
                reported_fill,
            },
        );
    }

    fn archive(&mut self, order: Order) {
        self.history.push_back(order);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

fn fill_of(order: &Order, reference_price: f64) -> Option<Fill> {
    if order.filled_size <= 0.0 {
        return None;
    }
    Some(Fill {
        client_id: order.client_id.clone(),
        order_id: order.id.clone().unwrap_or_default(),
        symbol: order.symbol.clone(),
        side: order.side,
        size: order.filled_size,
        avg_price: order.avg_fill_price.unwrap_or(reference_price),
        role: order.role,
        protection: Protection::default(),
    })
}
