use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrderError;
use crate::exchange::{ExchangeOrderStatus, OrderAck, OrderRequest};
use crate::models::{OrderKind, Side};

/// Lifecycle of an order as the engine tracks it
///
/// `Pending → Open → {Filled, Cancelled, Rejected}` plus `Pending → Rejected`.
/// Partial fills keep an order `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Rejected)
                | (Open, Open)
                | (Open, Filled)
                | (Open, Cancelled)
                | (Open, Rejected)
        )
    }
}

impl From<ExchangeOrderStatus> for OrderState {
    fn from(status: ExchangeOrderStatus) -> Self {
        match status {
            ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled => OrderState::Open,
            ExchangeOrderStatus::Filled => OrderState::Filled,
            ExchangeOrderStatus::Cancelled => OrderState::Cancelled,
            ExchangeOrderStatus::Rejected => OrderState::Rejected,
        }
    }
}

/// What an order is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    /// Native OCO stop-loss/take-profit pair
    Bracket,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange id, known once acknowledged
    pub id: Option<String>,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub role: OrderRole,
    pub requested_size: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        client_id: String,
        symbol: &str,
        side: Side,
        kind: OrderKind,
        role: OrderRole,
        size: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            client_id,
            symbol: symbol.to_string(),
            side,
            kind,
            role,
            requested_size: size,
            price: None,
            stop_price: None,
            take_profit_price: None,
            filled_size: 0.0,
            avg_fill_price: None,
            state: OrderState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_prices(
        mut self,
        price: Option<f64>,
        stop_price: Option<f64>,
        take_profit_price: Option<f64>,
    ) -> Self {
        self.price = price;
        self.stop_price = stop_price;
        self.take_profit_price = take_profit_price;
        self
    }

    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_id: self.client_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            kind: self.kind,
            size: self.requested_size,
            price: self.price,
            stop_price: self.stop_price,
            take_profit_price: self.take_profit_price,
        }
    }

    /// Move to `next`, refusing regressions and exits from terminal states
    pub fn transition(&mut self, next: OrderState) -> Result<(), OrderError> {
        if !self.state.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                client_id: self.client_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold an exchange report into this order
    ///
    /// A report of a terminal status for a still-`Pending` order passes
    /// through `Open`. Filled size may only grow.
    pub fn apply_ack(&mut self, ack: &OrderAck) -> Result<(), OrderError> {
        if ack.filled_size + f64::EPSILON < self.filled_size {
            return Err(OrderError::FillRegression {
                client_id: self.client_id.clone(),
                previous: self.filled_size,
                reported: ack.filled_size,
            });
        }

        let next = OrderState::from(ack.status);
        if next != self.state {
            if self.state == OrderState::Pending && next != OrderState::Rejected {
                self.transition(OrderState::Open)?;
            }
            if next != self.state {
                self.transition(next)?;
            }
        }

        self.id = Some(ack.id.clone());
        self.filled_size = ack.filled_size;
        if ack.avg_fill_price.is_some() {
            self.avg_fill_price = ack.avg_fill_price;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn remaining(&self) -> f64 {
        (self.requested_size - self.filled_size).max(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(
            "tl-1".into(),
            "BTCUSDT",
            Side::Buy,
            OrderKind::Market,
            OrderRole::Entry,
            2.0,
        )
    }

    fn ack(status: ExchangeOrderStatus, filled: f64) -> OrderAck {
        OrderAck {
            id: "ex-1".into(),
            client_id: "tl-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            kind: OrderKind::Market,
            status,
            size: 2.0,
            filled_size: filled,
            avg_fill_price: (filled > 0.0).then_some(1_000.0),
            stop_price: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut order = order();
        order.transition(OrderState::Open).unwrap();
        order.transition(OrderState::Filled).unwrap();
        assert!(order.is_terminal());
    }

    #[test]
    fn test_pending_can_be_rejected_directly() {
        let mut order = order();
        order.transition(OrderState::Rejected).unwrap();
        assert_eq!(order.state, OrderState::Rejected);
    }

    #[test]
    fn test_no_regression_and_no_exit_from_terminal() {
        let all = [
            OrderState::Pending,
            OrderState::Open,
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
        ];

        for terminal in [OrderState::Filled, OrderState::Cancelled, OrderState::Rejected] {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{:?} -> {:?}", terminal, next);
            }
        }
        assert!(!OrderState::Open.can_transition_to(OrderState::Pending));
        assert!(!OrderState::Pending.can_transition_to(OrderState::Filled));

        let mut order = order();
        order.transition(OrderState::Open).unwrap();
        order.transition(OrderState::Cancelled).unwrap();
        let err = order.transition(OrderState::Open).unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(order.state, OrderState::Cancelled);
    }

    #[test]
    fn test_immediate_fill_ack_passes_through_open() {
        let mut order = order();
        order.apply_ack(&ack(ExchangeOrderStatus::Filled, 2.0)).unwrap();

        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.id.as_deref(), Some("ex-1"));
        assert_eq!(order.avg_fill_price, Some(1_000.0));
        assert_eq!(order.remaining(), 0.0);
    }

    #[test]
    fn test_partial_fills_keep_order_open() {
        let mut order = order();
        order
            .apply_ack(&ack(ExchangeOrderStatus::PartiallyFilled, 0.5))
            .unwrap();
        order
            .apply_ack(&ack(ExchangeOrderStatus::PartiallyFilled, 1.5))
            .unwrap();

        assert_eq!(order.state, OrderState::Open);
        assert_eq!(order.filled_size, 1.5);
        assert_eq!(order.remaining(), 0.5);
    }

    #[test]
    fn test_fill_regression_is_refused() {
        let mut order = order();
        order
            .apply_ack(&ack(ExchangeOrderStatus::PartiallyFilled, 1.5))
            .unwrap();
        let err = order
            .apply_ack(&ack(ExchangeOrderStatus::PartiallyFilled, 1.0))
            .unwrap_err();

        assert!(matches!(err, OrderError::FillRegression { .. }));
        assert_eq!(order.filled_size, 1.5);
    }

    #[test]
    fn test_fill_report_after_cancel_is_refused() {
        let mut order = order();
        order.apply_ack(&ack(ExchangeOrderStatus::New, 0.0)).unwrap();
        order
            .apply_ack(&ack(ExchangeOrderStatus::Cancelled, 0.0))
            .unwrap();

        assert!(order
            .apply_ack(&ack(ExchangeOrderStatus::Filled, 2.0))
            .is_err());
        assert_eq!(order.state, OrderState::Cancelled);
    }
}
