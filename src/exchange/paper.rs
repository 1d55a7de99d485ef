//! In-memory sandbox exchange
//!
//! Fills market orders against the last known price, holds stop and limit
//! orders until the price crosses them, and keeps a cash/holdings ledger so
//! balances move with fills. Prices come from a seeded random walk unless a
//! symbol has been scripted with [`PaperExchange::set_price`] or
//! [`PaperExchange::set_bars`].
//!
//! Failures can be scripted per operation, which makes this the exchange double
//! used by the engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ExchangeConnector, ExchangeOrderStatus, OrderAck, OrderRequest};
use crate::config::Settings;
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Balance, Candle, MarketSnapshot, OrderKind, Side, Timeframe};

const MAX_BARS: usize = 1_000;
const WALK_START_PRICE: f64 = 100.0;

/// Connector operation, used to script failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    FetchOhlcv,
    CreateOrder,
    CancelOrder,
    FetchOpenOrders,
    FetchOrder,
    FetchBalance,
    Ping,
    Reconnect,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    ack: OrderAck,
    limit_price: Option<f64>,
    take_profit_price: Option<f64>,
}

#[derive(Debug)]
struct Book {
    bars: Vec<Candle>,
    scripted: bool,
}

impl Book {
    fn last_price(&self) -> Option<f64> {
        self.bars.last().map(|c| c.close)
    }
}

#[derive(Debug)]
struct PaperState {
    cash: f64,
    holdings: HashMap<String, f64>,
    books: HashMap<String, Book>,
    orders: HashMap<String, PaperOrder>,
    by_client_id: HashMap<String, String>,
    next_id: u64,
    failures: HashMap<PaperOp, VecDeque<ExchangeError>>,
    calls: HashMap<PaperOp, usize>,
    rng: StdRng,
}

pub struct PaperExchange {
    name: String,
    quote_currency: String,
    fill_ratio: f64,
    conditional_orders: bool,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64, quote_currency: &str) -> Self {
        Self {
            name: "paper".to_string(),
            quote_currency: quote_currency.to_string(),
            fill_ratio: 1.0,
            conditional_orders: false,
            state: Mutex::new(PaperState {
                cash: initial_balance,
                holdings: HashMap::new(),
                books: HashMap::new(),
                orders: HashMap::new(),
                by_client_id: HashMap::new(),
                next_id: 1,
                failures: HashMap::new(),
                calls: HashMap::new(),
                rng: StdRng::seed_from_u64(42),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let exchange = &settings.exchange;
        Self::new(
            settings.trading.initial_balance,
            &settings.trading.quote_currency,
        )
        .with_name(&exchange.name)
        .with_fill_ratio(exchange.paper_fill_ratio)
        .with_conditional_orders(exchange.paper_conditional_orders)
        .with_seed(exchange.paper_seed)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fraction of every market order that fills immediately; the rest stays open
    pub fn with_fill_ratio(mut self, ratio: f64) -> Self {
        self.fill_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_conditional_orders(mut self, enabled: bool) -> Self {
        self.conditional_orders = enabled;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a bar closing at `price` and trigger any resting orders it crosses
    ///
    /// A symbol with a scripted price no longer random-walks.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.lock();
        let book = state.books.entry(symbol.to_string()).or_insert(Book {
            bars: Vec::new(),
            scripted: true,
        });
        book.scripted = true;

        let open = book.last_price().unwrap_or(price);
        book.bars.push(Candle {
            timestamp: Utc::now(),
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume: 1_000.0,
        });
        trim(&mut book.bars);

        evaluate_resting_orders(&mut state, symbol, price);
    }

    /// Replace the bar history for `symbol`
    pub fn set_bars(&self, symbol: &str, bars: Vec<Candle>) {
        let mut state = self.lock();
        let last = bars.last().map(|c| c.close);
        state.books.insert(
            symbol.to_string(),
            Book {
                bars,
                scripted: true,
            },
        );
        if let Some(price) = last {
            evaluate_resting_orders(&mut state, symbol, price);
        }
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.fail_times(op, 1, error);
    }

    /// Make the next `times` calls of `op` fail with `error`
    pub fn fail_times(&self, op: PaperOp, times: usize, error: ExchangeError) {
        let mut state = self.lock();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Calls made to `op`, including failed ones
    pub fn calls(&self, op: PaperOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Signed quantity held: positive long, negative short
    pub fn holdings(&self, symbol: &str) -> f64 {
        self.lock().holdings.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn cash(&self) -> f64 {
        self.lock().cash
    }

    pub fn order_by_client_id(&self, client_id: &str) -> Option<OrderAck> {
        let state = self.lock();
        state
            .by_client_id
            .get(client_id)
            .and_then(|id| state.orders.get(id))
            .map(|o| o.ack.clone())
    }

    /// All orders ever accepted, oldest first
    pub fn orders(&self) -> Vec<OrderAck> {
        let state = self.lock();
        let mut orders: Vec<OrderAck> = state.orders.values().map(|o| o.ack.clone()).collect();
        orders.sort_by_key(|o| o.id.trim_start_matches("paper-").parse::<u64>().unwrap_or(0));
        orders
    }

    /// Count the call and pop a scripted failure if one is queued
    fn enter(&self, op: PaperOp) -> ExchangeResult<MutexGuard<'_, PaperState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state)
    }
}

fn trim(bars: &mut Vec<Candle>) {
    if bars.len() > MAX_BARS {
        let excess = bars.len() - MAX_BARS;
        bars.drain(..excess);
    }
}

fn random_walk(rng: &mut StdRng, timeframe: Timeframe, count: usize) -> Vec<Candle> {
    let width = ChronoDuration::seconds(timeframe.seconds());
    let start = Utc::now() - width * count as i32;
    let mut price = WALK_START_PRICE;

    (0..count)
        .map(|i| {
            let candle = next_bar(rng, price, start + width * i as i32);
            price = candle.close;
            candle
        })
        .collect()
}

fn next_bar(rng: &mut StdRng, open: f64, timestamp: chrono::DateTime<Utc>) -> Candle {
    let change = rng.gen_range(-0.01..0.01);
    let close = (open * (1.0 + change)).max(0.01);
    let wick = open.max(close) * rng.gen_range(0.0..0.003);
    Candle {
        timestamp,
        open,
        high: open.max(close) + wick,
        low: (open.min(close) - wick).max(0.0),
        close,
        volume: rng.gen_range(500.0..1_500.0),
    }
}

/// Fill `qty` of an order at `price`, moving cash and holdings
fn apply_fill(state: &mut PaperState, order_id: &str, qty: f64, price: f64) {
    let Some(order) = state.orders.get_mut(order_id) else {
        return;
    };
    let ack = &mut order.ack;

    let previous_notional = ack.avg_fill_price.unwrap_or(0.0) * ack.filled_size;
    ack.filled_size += qty;
    ack.avg_fill_price = Some((previous_notional + qty * price) / ack.filled_size);
    ack.status = if ack.filled_size + f64::EPSILON >= ack.size {
        ExchangeOrderStatus::Filled
    } else {
        ExchangeOrderStatus::PartiallyFilled
    };
    ack.updated_at = Utc::now();

    let sign = ack.side.sign();
    let symbol = ack.symbol.clone();
    *state.holdings.entry(symbol).or_insert(0.0) += sign * qty;
    state.cash -= sign * qty * price;
}

/// Fill resting stop/limit orders that `price` crosses
fn evaluate_resting_orders(state: &mut PaperState, symbol: &str, price: f64) {
    let triggered: Vec<(String, f64)> = state
        .orders
        .values()
        .filter(|o| o.ack.symbol == symbol && o.ack.status.is_open())
        .filter(|o| o.ack.kind != OrderKind::Market)
        .filter(|o| crosses(o, price))
        .map(|o| (o.ack.id.clone(), o.ack.size - o.ack.filled_size))
        .collect();

    for (id, remaining) in triggered {
        tracing::debug!(order_id = %id, price, "Paper order triggered");
        apply_fill(state, &id, remaining, price);
    }
}

fn crosses(order: &PaperOrder, price: f64) -> bool {
    let stop_hit = order.ack.stop_price.is_some_and(|stop| match order.ack.side {
        Side::Sell => price <= stop,
        Side::Buy => price >= stop,
    });
    // Take-profit leg of a bracket, or a plain limit order
    let target = order.take_profit_price.or(order.limit_price);
    let target_hit = target.is_some_and(|target| match order.ack.side {
        Side::Sell => price >= target,
        Side::Buy => price <= target,
    });
    stop_hit || target_hit
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_conditional_orders(&self) -> bool {
        self.conditional_orders
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<MarketSnapshot> {
        let mut state = self.enter(PaperOp::FetchOhlcv)?;
        let state = &mut *state;

        if !state.books.contains_key(symbol) {
            let bars = random_walk(&mut state.rng, timeframe, limit.max(1));
            state.books.insert(
                symbol.to_string(),
                Book {
                    bars,
                    scripted: false,
                },
            );
        } else if let Some(book) = state.books.get_mut(symbol) {
            if !book.scripted {
                if let Some(open) = book.last_price() {
                    let bar = next_bar(&mut state.rng, open, Utc::now());
                    book.bars.push(bar);
                    trim(&mut book.bars);
                }
            }
        }

        let bars = state
            .books
            .get(symbol)
            .map(|book| {
                let start = book.bars.len().saturating_sub(limit);
                book.bars[start..].to_vec()
            })
            .unwrap_or_default();

        if let Some(price) = bars.last().map(|c| c.close) {
            evaluate_resting_orders(state, symbol, price);
        }

        Ok(MarketSnapshot::new(symbol, timeframe, bars))
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut state = self.enter(PaperOp::CreateOrder)?;
        let state = &mut *state;

        // Same client id: hand back the original order
        if let Some(existing) = state
            .by_client_id
            .get(&request.client_id)
            .and_then(|id| state.orders.get(id))
        {
            return Ok(existing.ack.clone());
        }

        if !request.size.is_finite() || request.size <= 0.0 {
            return Err(ExchangeError::Rejected(format!(
                "invalid size {}",
                request.size
            )));
        }

        let price = state
            .books
            .get(&request.symbol)
            .and_then(Book::last_price)
            .ok_or_else(|| {
                ExchangeError::Rejected(format!("no market for {}", request.symbol))
            })?;

        let held = state.holdings.get(&request.symbol).copied().unwrap_or(0.0);
        if request.kind == OrderKind::Market
            && request.side == Side::Buy
            && held >= 0.0
            && request.size * price > state.cash
        {
            return Err(ExchangeError::Rejected(format!(
                "insufficient balance: need {:.2}, have {:.2}",
                request.size * price,
                state.cash
            )));
        }

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        let order = PaperOrder {
            ack: OrderAck {
                id: id.clone(),
                client_id: request.client_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                kind: request.kind,
                status: ExchangeOrderStatus::New,
                size: request.size,
                filled_size: 0.0,
                avg_fill_price: None,
                stop_price: request.stop_price,
                updated_at: Utc::now(),
            },
            limit_price: request.price,
            take_profit_price: request.take_profit_price,
        };
        state.orders.insert(id.clone(), order);
        state
            .by_client_id
            .insert(request.client_id.clone(), id.clone());

        match request.kind {
            OrderKind::Market => {
                let qty = request.size * self.fill_ratio;
                if qty > 0.0 {
                    apply_fill(state, &id, qty, price);
                }
            }
            OrderKind::Limit | OrderKind::Stop => evaluate_resting_orders(state, &request.symbol, price),
        }

        tracing::debug!(
            order_id = %id,
            client_id = %request.client_id,
            symbol = %request.symbol,
            side = %request.side,
            kind = request.kind.as_str(),
            size = request.size,
            "Paper order accepted"
        );

        state
            .orders
            .get(&id)
            .map(|o| o.ack.clone())
            .ok_or_else(|| ExchangeError::Protocol(format!("order {} vanished", id)))
    }

    async fn cancel_order(&self, _symbol: &str, id: &str) -> ExchangeResult<()> {
        let mut state = self.enter(PaperOp::CancelOrder)?;

        let order = state
            .orders
            .get_mut(id)
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", id)))?;

        if !order.ack.status.is_open() {
            return Err(ExchangeError::Rejected(format!(
                "order {} is not open ({:?})",
                id, order.ack.status
            )));
        }

        order.ack.status = ExchangeOrderStatus::Cancelled;
        order.ack.updated_at = Utc::now();
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderAck>> {
        let state = self.enter(PaperOp::FetchOpenOrders)?;
        Ok(state
            .orders
            .values()
            .filter(|o| o.ack.symbol == symbol && o.ack.status.is_open())
            .map(|o| o.ack.clone())
            .collect())
    }

    async fn fetch_order(&self, _symbol: &str, id: &str) -> ExchangeResult<OrderAck> {
        let state = self.enter(PaperOp::FetchOrder)?;
        state
            .orders
            .get(id)
            .map(|o| o.ack.clone())
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", id)))
    }

    async fn fetch_balance(&self) -> ExchangeResult<Balance> {
        let state = self.enter(PaperOp::FetchBalance)?;

        let marked: f64 = state
            .holdings
            .iter()
            .filter_map(|(symbol, qty)| {
                state
                    .books
                    .get(symbol)
                    .and_then(Book::last_price)
                    .map(|price| qty * price)
            })
            .sum();

        Ok(Balance {
            currency: self.quote_currency.clone(),
            total: state.cash + marked,
            free: state.cash.max(0.0),
        })
    }

    async fn ping(&self) -> ExchangeResult<()> {
        self.enter(PaperOp::Ping).map(|_| ())
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        self.enter(PaperOp::Reconnect).map(|_| ())
    }
}
