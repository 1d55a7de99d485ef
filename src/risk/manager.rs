use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::RiskLimits;
use crate::execution::PositionTracker;
use crate::models::{Action, Balance, Decision, MarketSnapshot, Side};
use crate::risk::circuit_breakers::{BreakerKind, BreakerTransition, BreakerTrip, DrawdownBreaker};
use crate::risk::volatility::calculate_atr;

/// Approved entry, sized and with protective levels attached
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    /// Reference price the order was sized at
    pub entry_price: f64,
    pub stop_distance: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// `size × stop_distance`
    pub risk_amount: f64,
}

/// Why the risk manager refused a decision
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("hold decision")]
    Hold,
    #[error("short entries are disabled")]
    ShortingDisabled,
    #[error("max concurrent positions reached ({open}/{max})")]
    MaxConcurrentPositions { open: usize, max: usize },
    #[error("already have an open position for {0}")]
    SymbolAlreadyOpen(String),
    #[error("{kind:?} circuit breaker tripped at {value:.4}")]
    CircuitBreaker { kind: BreakerKind, value: f64 },
    #[error("no usable price in snapshot")]
    NoPrice,
    #[error("invalid stop distance {0}")]
    InvalidStop(f64),
    #[error("invalid order size {0}")]
    InvalidSize(f64),
    #[error("portfolio heat {projected:.2} would exceed limit {limit:.2}")]
    PortfolioHeat { projected: f64, limit: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskOutcome {
    Approved(SizedOrder),
    Rejected(RiskViolation),
}

/// Validates and sizes entries; owns the equity circuit breakers
pub struct RiskManager {
    limits: RiskLimits,
    breaker: DrawdownBreaker,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        let breaker = DrawdownBreaker::new(&limits);
        Self { limits, breaker }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn breaker(&self) -> &DrawdownBreaker {
        &self.breaker
    }

    /// Feed an equity observation to the breakers
    pub fn observe_equity(&mut self, equity: f64, now: DateTime<Utc>) -> Vec<BreakerTransition> {
        self.breaker.observe(equity, now)
    }

    /// Decide whether `decision` may open a position, and at what size
    ///
    /// Pure over the passed-in state plus the breaker.
    pub fn evaluate(
        &self,
        decision: &Decision,
        snapshot: &MarketSnapshot,
        positions: &PositionTracker,
        balance: &Balance,
    ) -> RiskOutcome {
        match self.check(decision, snapshot, positions, balance) {
            Ok(order) => RiskOutcome::Approved(order),
            Err(violation) => RiskOutcome::Rejected(violation),
        }
    }

    fn check(
        &self,
        decision: &Decision,
        snapshot: &MarketSnapshot,
        positions: &PositionTracker,
        balance: &Balance,
    ) -> Result<SizedOrder, RiskViolation> {
        let limits = &self.limits;

        let side = match decision.action {
            Action::Hold => return Err(RiskViolation::Hold),
            Action::Buy => Side::Buy,
            Action::Sell if limits.allow_short => Side::Sell,
            Action::Sell => return Err(RiskViolation::ShortingDisabled),
        };

        // Check 1: position limits
        let open = positions.count();
        if open >= limits.max_concurrent_positions {
            return Err(RiskViolation::MaxConcurrentPositions {
                open,
                max: limits.max_concurrent_positions,
            });
        }
        if limits.max_positions_per_symbol_enabled && positions.has_position(&decision.symbol) {
            return Err(RiskViolation::SymbolAlreadyOpen(decision.symbol.clone()));
        }

        // Check 2: circuit breakers
        if let Err(BreakerTrip { kind, value }) = self.breaker.check() {
            return Err(RiskViolation::CircuitBreaker { kind, value });
        }

        // Check 3: protective levels
        let price = snapshot
            .last_price()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(RiskViolation::NoPrice)?;
        let stop_distance = self.stop_distance(decision, snapshot, price);
        let stop_loss = price - side.sign() * stop_distance;
        if !stop_distance.is_finite() || stop_distance <= 0.0 || stop_loss <= 0.0 {
            return Err(RiskViolation::InvalidStop(stop_distance));
        }
        let take_profit_distance = decision
            .take_profit_distance
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(limits.default_reward_risk * stop_distance);
        let take_profit = price + side.sign() * take_profit_distance;

        // Check 4: size from risk budget, capped by notional
        let equity = balance.total;
        let mut size = equity * limits.risk_fraction_per_trade / stop_distance;
        let mut max_notional = limits.max_position_size_fraction * equity;
        if side == Side::Buy {
            max_notional = max_notional.min(balance.free);
        }
        if size * price > max_notional {
            size = max_notional / price;
        }
        if !size.is_finite() || size <= 0.0 {
            return Err(RiskViolation::InvalidSize(size));
        }

        // Check 5: portfolio heat
        let risk_amount = size * stop_distance;
        let projected = positions.open_risk() + risk_amount;
        let heat_limit = limits.max_portfolio_heat * equity;
        if projected > heat_limit {
            return Err(RiskViolation::PortfolioHeat {
                projected,
                limit: heat_limit,
            });
        }

        Ok(SizedOrder {
            symbol: decision.symbol.clone(),
            side,
            size,
            entry_price: price,
            stop_distance,
            stop_loss,
            take_profit,
            risk_amount,
        })
    }

    /// Strategy-supplied distance, else ATR-based, else a fixed fraction of price
    fn stop_distance(&self, decision: &Decision, snapshot: &MarketSnapshot, price: f64) -> f64 {
        if let Some(distance) = decision.stop_distance {
            return distance;
        }
        calculate_atr(&snapshot.bars, self.limits.atr_period)
            .map(|atr| atr * self.limits.atr_stop_multiplier)
            .filter(|d| *d > 0.0)
            .unwrap_or(price * self.limits.fallback_stop_fraction)
    }
}
