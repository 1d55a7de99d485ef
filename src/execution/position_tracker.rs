use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::exchange::{ExchangeOrderStatus, OrderAck};
use crate::execution::executor::{CloseReport, ExecutionOutcome, Fill};
use crate::execution::OrderRole;
use crate::models::{Balance, ExitReason, Side, TradeRecord};
use crate::risk::SizedOrder;

/// Exchange-side protective orders attached to a position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Protection {
    pub stop_loss_id: Option<String>,
    pub take_profit_id: Option<String>,
    /// Native OCO order covering both legs
    pub bracket_id: Option<String>,
    /// Trigger price of the resting stop or bracket
    pub stop_price: Option<f64>,
}

impl Protection {
    pub fn order_ids(&self) -> Vec<String> {
        [&self.stop_loss_id, &self.take_profit_id, &self.bracket_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stop_loss_id.is_none() && self.take_profit_id.is_none() && self.bracket_id.is_none()
    }

    fn role_of(&self, order_id: &str) -> Option<OrderRole> {
        if self.stop_loss_id.as_deref() == Some(order_id) {
            Some(OrderRole::StopLoss)
        } else if self.take_profit_id.as_deref() == Some(order_id) {
            Some(OrderRole::TakeProfit)
        } else if self.bracket_id.as_deref() == Some(order_id) {
            Some(OrderRole::Bracket)
        } else {
            None
        }
    }

    fn forget(&mut self, order_id: &str) {
        for slot in [
            &mut self.stop_loss_id,
            &mut self.take_profit_id,
            &mut self.bracket_id,
        ] {
            if slot.as_deref() == Some(order_id) {
                *slot = None;
            }
        }
        if self.stop_loss_id.is_none() && self.bracket_id.is_none() {
            self.stop_price = None;
        }
    }
}

/// A trailed stop that has moved past the one resting on the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct StopUpdate {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub protection: Protection,
}

/// A close that has been handed to the executor
#[derive(Debug, Clone, PartialEq)]
pub struct PendingClose {
    pub reason: ExitReason,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_distance: Option<f64>,
    /// Highest price seen for a long, lowest for a short
    pub best_price: f64,
    pub last_price: f64,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub protection: Protection,
    pub closing: Option<PendingClose>,
    closed_size: f64,
    exit_notional: f64,
}

impl Position {
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Loss if the stop is hit from entry; zero once the stop locks in profit
    pub fn risk(&self) -> f64 {
        ((self.entry_price - self.stop_loss) * self.size * self.side.sign()).max(0.0)
    }

    fn stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Buy => price <= self.stop_loss,
            Side::Sell => price >= self.stop_loss,
        }
    }

    fn target_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Buy => price >= self.take_profit,
            Side::Sell => price <= self.take_profit,
        }
    }

    /// Move the best price and ratchet the trailing stop; never loosens
    fn trail(&mut self, price: f64) {
        match self.side {
            Side::Buy => {
                self.best_price = self.best_price.max(price);
                if let Some(trail) = self.trailing_distance {
                    self.stop_loss = self.stop_loss.max(self.best_price - trail);
                }
            }
            Side::Sell => {
                self.best_price = self.best_price.min(price);
                if let Some(trail) = self.trailing_distance {
                    self.stop_loss = self.stop_loss.min(self.best_price + trail);
                }
            }
        }
    }
}

/// Exit the executor should perform for one position
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub position_id: Uuid,
    pub symbol: String,
    /// Side of the position, not of the exit order
    pub side: Side,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reason: ExitReason,
    pub protection: Protection,
}

/// A position the exchange closed through a protective order
#[derive(Debug, Clone)]
pub struct ReconciledClose {
    pub record: TradeRecord,
    /// Sibling protective orders still resting on the exchange
    pub stale_order_ids: Vec<String>,
}

/// Owns open positions
#[derive(Default)]
pub struct PositionTracker {
    positions: HashMap<Uuid, Position>,
    realized_total: f64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a filled entry as a new position
    pub fn open(&mut self, sized: &SizedOrder, fill: &Fill, trailing_distance: Option<f64>) -> Uuid {
        let id = Uuid::new_v4();
        let position = Position {
            id,
            symbol: sized.symbol.clone(),
            side: sized.side,
            size: fill.size,
            entry_price: fill.avg_price,
            stop_loss: sized.stop_loss,
            take_profit: sized.take_profit,
            trailing_distance: trailing_distance.filter(|d| d.is_finite() && *d > 0.0),
            best_price: fill.avg_price,
            last_price: fill.avg_price,
            opened_at: Utc::now(),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            protection: fill.protection.clone(),
            closing: None,
            closed_size: 0.0,
            exit_notional: 0.0,
        };

        tracing::info!(
            position_id = %id,
            symbol = %position.symbol,
            side = %position.side,
            size = position.size,
            entry = position.entry_price,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "Position opened"
        );

        self.positions.insert(id, position);
        id
    }

    /// Mark positions on `symbol` to `price` and return any exits to perform
    ///
    /// A position whose close is already in flight yields nothing.
    pub fn update_price(&mut self, symbol: &str, price: f64) -> Vec<CloseRequest> {
        if !price.is_finite() || price <= 0.0 {
            return Vec::new();
        }

        let mut requests = Vec::new();
        for position in self.positions.values_mut().filter(|p| p.symbol == symbol) {
            position.last_price = price;
            position.unrealized_pnl = position.pnl_at(price);
            position.trail(price);

            let reason = if position.stop_hit(price) {
                ExitReason::StopLoss
            } else if position.target_hit(price) {
                ExitReason::TakeProfit
            } else {
                continue;
            };

            if position.closing.is_some() {
                tracing::debug!(position_id = %position.id, "Close already in flight");
                continue;
            }

            requests.push(begin_close(position, reason));
        }
        requests
    }

    /// Positions on `symbol` whose local stop is tighter than the exchange stop
    pub fn stops_to_move(&self, symbol: &str) -> Vec<StopUpdate> {
        self.positions
            .values()
            .filter(|p| p.symbol == symbol && p.closing.is_none())
            .filter(|p| {
                p.protection
                    .stop_price
                    .is_some_and(|resting| (p.stop_loss - resting) * p.side.sign() > 1e-9)
            })
            .map(|p| StopUpdate {
                position_id: p.id,
                symbol: p.symbol.clone(),
                side: p.side,
                size: p.size,
                stop_loss: p.stop_loss,
                take_profit: p.take_profit,
                protection: p.protection.clone(),
            })
            .collect()
    }

    pub fn set_protection(&mut self, position_id: Uuid, protection: Protection) -> bool {
        match self.positions.get_mut(&position_id) {
            Some(position) => {
                position.protection = protection;
                true
            }
            None => false,
        }
    }

    /// Ask for a close outside of the price triggers (strategy exit, shutdown)
    pub fn request_close(&mut self, position_id: Uuid, reason: ExitReason) -> Option<CloseRequest> {
        let position = self.positions.get_mut(&position_id)?;
        if position.closing.is_some() {
            return None;
        }
        Some(begin_close(position, reason))
    }

    /// Apply the executor's result for a close started by this tracker
    ///
    /// Returns the trade record once the position is fully closed.
    pub fn finish_close(&mut self, position_id: Uuid, report: &CloseReport) -> Option<TradeRecord> {
        let position = self.positions.get_mut(&position_id)?;
        let requested = position
            .closing
            .take()
            .map(|c| c.reason)
            .unwrap_or(ExitReason::Manual);
        position.protection = report.replacement.clone();

        let fill = match &report.outcome {
            ExecutionOutcome::Filled(fill) | ExecutionOutcome::PartiallyFilled(fill) => fill,
            ExecutionOutcome::Unfilled | ExecutionOutcome::Rejected(_) => {
                tracing::warn!(position_id = %position_id, "Close did not fill, will retry");
                return None;
            }
        };

        let reason = match fill.role {
            OrderRole::StopLoss => ExitReason::StopLoss,
            OrderRole::TakeProfit => ExitReason::TakeProfit,
            OrderRole::Bracket => bracket_reason(position, fill.avg_price),
            OrderRole::Entry | OrderRole::Exit => requested,
        };
        self.apply_exit(position_id, fill.size, fill.avg_price, reason)
    }

    /// Close positions whose protective orders the exchange reports as done
    ///
    /// Filled protective orders close the position without another order.
    /// Protective orders cancelled by the exchange are forgotten so the
    /// position falls back to local stop monitoring.
    pub fn reconcile(&mut self, reports: &[OrderAck]) -> Vec<ReconciledClose> {
        let mut closes = Vec::new();

        for report in reports {
            let Some((position_id, role)) = self.positions.values().find_map(|p| {
                p.protection.role_of(&report.id).map(|role| (p.id, role))
            }) else {
                continue;
            };

            match report.status {
                ExchangeOrderStatus::Filled => {}
                ExchangeOrderStatus::Cancelled | ExchangeOrderStatus::Rejected => {
                    if let Some(position) = self.positions.get_mut(&position_id) {
                        tracing::warn!(
                            position_id = %position_id,
                            order_id = %report.id,
                            "Protective order gone, monitoring stop locally"
                        );
                        position.protection.forget(&report.id);
                    }
                    continue;
                }
                ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled => continue,
            }

            let Some(position) = self.positions.get_mut(&position_id) else {
                continue;
            };
            let exit_price = report
                .avg_fill_price
                .or(report.stop_price)
                .unwrap_or(position.last_price);
            let reason = match role {
                OrderRole::StopLoss => ExitReason::StopLoss,
                OrderRole::TakeProfit => ExitReason::TakeProfit,
                _ => bracket_reason(position, exit_price),
            };
            position.protection.forget(&report.id);
            let stale_order_ids = position.protection.order_ids();
            position.protection = Protection::default();
            position.closing = None;

            let size = report.filled_size.min(position.size);
            if let Some(record) = self.apply_exit(position_id, size, exit_price, reason) {
                closes.push(ReconciledClose {
                    record,
                    stale_order_ids,
                });
            }
        }

        closes
    }

    fn apply_exit(
        &mut self,
        position_id: Uuid,
        size: f64,
        price: f64,
        reason: ExitReason,
    ) -> Option<TradeRecord> {
        let position = self.positions.get_mut(&position_id)?;
        let size = size.min(position.size);
        let pnl = (price - position.entry_price) * size * position.side.sign();

        position.realized_pnl += pnl;
        position.closed_size += size;
        position.exit_notional += size * price;
        position.size -= size;
        self.realized_total += pnl;

        if position.size > f64::EPSILON * position.closed_size.max(1.0) {
            tracing::info!(
                position_id = %position_id,
                closed = size,
                remaining = position.size,
                "Position partially closed"
            );
            return None;
        }

        let position = self.positions.remove(&position_id)?;
        let record = TradeRecord {
            position_id,
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.closed_size,
            entry_price: position.entry_price,
            exit_price: position.exit_notional / position.closed_size,
            realized_pnl: position.realized_pnl,
            reason,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };

        tracing::info!(
            position_id = %position_id,
            symbol = %record.symbol,
            reason = reason.as_str(),
            exit = record.exit_price,
            pnl = record.realized_pnl,
            "Position closed"
        );

        Some(record)
    }

    pub fn get(&self, position_id: Uuid) -> Option<&Position> {
        self.positions.get(&position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position_for(&self, symbol: &str) -> Option<&Position> {
        self.positions.values().find(|p| p.symbol == symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.position_for(symbol).is_some()
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    /// Sum of open position risk
    pub fn open_risk(&self) -> f64 {
        self.positions.values().map(Position::risk).sum()
    }

    /// Free cash plus the signed notional of tracked positions at last price
    pub fn equity(&self, balance: &Balance) -> f64 {
        balance.free
            + self
                .positions
                .values()
                .map(|p| p.size * p.last_price * p.side.sign())
                .sum::<f64>()
    }

    pub fn realized_total(&self) -> f64 {
        self.realized_total
    }
}

fn begin_close(position: &mut Position, reason: ExitReason) -> CloseRequest {
    position.closing = Some(PendingClose {
        reason,
        requested_at: Utc::now(),
    });

    tracing::info!(
        position_id = %position.id,
        symbol = %position.symbol,
        reason = reason.as_str(),
        price = position.last_price,
        "Closing position"
    );

    CloseRequest {
        position_id: position.id,
        symbol: position.symbol.clone(),
        side: position.side,
        size: position.size,
        stop_loss: position.stop_loss,
        take_profit: position.take_profit,
        reason,
        protection: position.protection.clone(),
    }
}

/// Which leg of an OCO bracket filled, judged by the fill price
fn bracket_reason(position: &Position, exit_price: f64) -> ExitReason {
    if position.pnl_at(exit_price) < 0.0 {
        ExitReason::StopLoss
    } else {
        ExitReason::TakeProfit
    }
}
