// Exchange connectors
pub mod http;
pub mod paper;
pub mod rate_limit;
pub mod retry;

pub use http::HttpExchange;
pub use paper::{PaperExchange, PaperOp};
pub use rate_limit::RequestLimiter;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ExchangeKind, Settings};
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Balance, MarketSnapshot, OrderKind, Side, Timeframe};

/// Order as submitted to an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency key, reused verbatim on every retry of the same submission
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size: f64,
    /// Limit price; `None` for market and stop orders
    pub price: Option<f64>,
    /// Trigger price for stop orders
    pub stop_price: Option<f64>,
    /// Set together with `stop_price` to request one OCO bracket
    pub take_profit_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(client_id: String, symbol: &str, side: Side, size: f64) -> Self {
        Self {
            client_id,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            size,
            price: None,
            stop_price: None,
            take_profit_price: None,
        }
    }

    /// Is this a one-cancels-other bracket
    pub fn is_bracket(&self) -> bool {
        self.stop_price.is_some() && self.take_profit_price.is_some()
    }
}

/// Order status as the exchange reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl ExchangeOrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled
        )
    }
}

/// Exchange acknowledgement / status report for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub status: ExchangeOrderStatus,
    pub size: f64,
    pub filled_size: f64,
    pub avg_fill_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// The only component that talks to an exchange
///
/// Implementations classify every failure into [`ExchangeError`] and retry
/// transient ones internally. Callers still bound each call with
/// [`with_timeout`].
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the exchange accepts a native OCO stop/take-profit bracket
    fn supports_conditional_orders(&self) -> bool;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<MarketSnapshot>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, id: &str) -> ExchangeResult<()>;

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderAck>>;

    async fn fetch_order(&self, symbol: &str, id: &str) -> ExchangeResult<OrderAck>;

    async fn fetch_balance(&self) -> ExchangeResult<Balance>;

    /// Cheap connectivity check
    async fn ping(&self) -> ExchangeResult<()>;

    /// Re-establish the session after connectivity loss
    async fn reconnect(&self) -> ExchangeResult<()>;
}

/// Bound an exchange call by `limit`; an elapsed deadline is transient
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> ExchangeResult<T>
where
    F: Future<Output = ExchangeResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Transient(format!(
            "call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Build the connector selected by `exchange.kind`
pub fn build_connector(settings: &Settings) -> ExchangeResult<Arc<dyn ExchangeConnector>> {
    match settings.exchange.kind {
        ExchangeKind::Paper => Ok(Arc::new(PaperExchange::from_settings(settings))),
        ExchangeKind::Http => Ok(Arc::new(HttpExchange::new(
            &settings.exchange,
            &settings.trading.quote_currency,
        )?)),
    }
}
