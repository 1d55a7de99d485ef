use crate::models::{Action, Decision, MarketSnapshot};
use crate::strategy::Strategy;

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Fast/slow moving average crossover
///
/// Buys when the fast SMA crosses above the slow SMA on the latest bar and
/// sells on the opposite cross. Confidence scales with how far apart the two
/// averages are after the cross. Stop distances are left to the risk manager.
pub struct SmaCrossStrategy {
    fast: usize,
    slow: usize,
}

impl SmaCrossStrategy {
    pub fn new(fast: usize, slow: usize) -> Self {
        let fast = fast.max(1);
        Self {
            fast,
            slow: slow.max(fast + 1),
        }
    }
}

impl Strategy for SmaCrossStrategy {
    fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        let closes = snapshot.closes();
        if closes.len() < self.warmup_bars() {
            return Decision::hold(snapshot.symbol.clone());
        }

        let previous = &closes[..closes.len() - 1];
        let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) = (
            calculate_sma(&closes, self.fast),
            calculate_sma(&closes, self.slow),
            calculate_sma(previous, self.fast),
            calculate_sma(previous, self.slow),
        ) else {
            return Decision::hold(snapshot.symbol.clone());
        };

        let action = if fast_prev <= slow_prev && fast_now > slow_now {
            Action::Buy
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Action::Sell
        } else {
            Action::Hold
        };

        if action == Action::Hold {
            return Decision::hold(snapshot.symbol.clone());
        }

        // 1% separation between the averages counts as full conviction
        let separation = ((fast_now - slow_now) / slow_now).abs();
        let confidence = (separation * 100.0).min(1.0);

        tracing::debug!(
            symbol = %snapshot.symbol,
            fast = fast_now,
            slow = slow_now,
            ?action,
            confidence,
            "SMA crossover"
        );

        Decision::new(snapshot.symbol.clone(), action, confidence)
    }

    fn name(&self) -> &str {
        "sma_cross"
    }

    fn warmup_bars(&self) -> usize {
        self.slow + 1
    }
}
