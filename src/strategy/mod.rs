// Trading strategy port
pub mod sma_cross;

pub use sma_cross::SmaCrossStrategy;

use crate::config::{StrategyKind, StrategySettings};
use crate::models::{Decision, MarketSnapshot};

/// Base trait for all trading strategies
///
/// Strategies are pure: the same snapshot always yields the same decision.
pub trait Strategy: Send + Sync {
    /// Decide what to do with the latest snapshot
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Bars needed before the strategy can emit anything but Hold
    fn warmup_bars(&self) -> usize;
}

/// Never trades; useful for running the engine as a pure monitor
#[derive(Debug, Default, Clone)]
pub struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        Decision::hold(snapshot.symbol.clone())
    }

    fn name(&self) -> &str {
        "hold"
    }

    fn warmup_bars(&self) -> usize {
        0
    }
}

/// Build the strategy selected by `strategy.kind`
pub fn from_settings(settings: &StrategySettings) -> Box<dyn Strategy> {
    match settings.kind {
        StrategyKind::Hold => Box::new(HoldStrategy),
        StrategyKind::SmaCross => Box::new(SmaCrossStrategy::new(
            settings.fast_period,
            settings.slow_period,
        )),
    }
}
