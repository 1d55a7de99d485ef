use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RiskLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerKind {
    /// Peak-to-trough equity drawdown
    Drawdown,
    /// Loss from start-of-day equity
    DailyLoss,
}

/// Why new entries are currently blocked
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerTrip {
    pub kind: BreakerKind,
    /// Drawdown or daily loss fraction at the time of the check
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerTransition {
    Tripped(BreakerTrip),
    Reset(BreakerTrip),
}

/// Equity circuit breakers
///
/// The drawdown breaker trips once drawdown from peak equity exceeds
/// `max_portfolio_drawdown` and stays tripped until drawdown falls to or below
/// `drawdown_recovery_threshold`. The daily-loss breaker trips once equity has
/// lost more than `max_daily_loss` of the UTC day's first observation and
/// clears at the next UTC day.
#[derive(Debug, Clone)]
pub struct DrawdownBreaker {
    max_drawdown: f64,
    recovery_threshold: f64,
    max_daily_loss: f64,
    peak_equity: Option<f64>,
    last_equity: Option<f64>,
    drawdown_tripped: bool,
    day: Option<NaiveDate>,
    day_start_equity: f64,
    daily_tripped: bool,
}

impl DrawdownBreaker {
    pub fn new(limits: &RiskLimits) -> Self {
        Self {
            max_drawdown: limits.max_portfolio_drawdown,
            recovery_threshold: limits.drawdown_recovery_threshold,
            max_daily_loss: limits.max_daily_loss,
            peak_equity: None,
            last_equity: None,
            drawdown_tripped: false,
            day: None,
            day_start_equity: 0.0,
            daily_tripped: false,
        }
    }

    /// Feed an equity observation; returns any state changes it caused
    pub fn observe(&mut self, equity: f64, now: DateTime<Utc>) -> Vec<BreakerTransition> {
        let mut transitions = Vec::new();
        if !equity.is_finite() {
            return transitions;
        }

        let peak = self.peak_equity.map_or(equity, |p| p.max(equity));
        self.peak_equity = Some(peak);
        self.last_equity = Some(equity);

        let drawdown = self.drawdown();
        let trip = BreakerTrip {
            kind: BreakerKind::Drawdown,
            value: drawdown,
        };
        if !self.drawdown_tripped && drawdown > self.max_drawdown {
            self.drawdown_tripped = true;
            transitions.push(BreakerTransition::Tripped(trip));
        } else if self.drawdown_tripped && drawdown <= self.recovery_threshold {
            self.drawdown_tripped = false;
            transitions.push(BreakerTransition::Reset(trip));
        }

        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_start_equity = equity;
            if self.daily_tripped {
                self.daily_tripped = false;
                transitions.push(BreakerTransition::Reset(BreakerTrip {
                    kind: BreakerKind::DailyLoss,
                    value: 0.0,
                }));
            }
        }

        let daily_loss = self.daily_loss();
        if !self.daily_tripped && daily_loss > self.max_daily_loss {
            self.daily_tripped = true;
            transitions.push(BreakerTransition::Tripped(BreakerTrip {
                kind: BreakerKind::DailyLoss,
                value: daily_loss,
            }));
        }

        transitions
    }

    /// Ok when new entries are allowed
    pub fn check(&self) -> Result<(), BreakerTrip> {
        if self.drawdown_tripped {
            return Err(BreakerTrip {
                kind: BreakerKind::Drawdown,
                value: self.drawdown(),
            });
        }
        if self.daily_tripped {
            return Err(BreakerTrip {
                kind: BreakerKind::DailyLoss,
                value: self.daily_loss(),
            });
        }
        Ok(())
    }

    /// Current drawdown from peak equity as a fraction
    pub fn drawdown(&self) -> f64 {
        match (self.peak_equity, self.last_equity) {
            (Some(peak), Some(equity)) if peak > 0.0 => ((peak - equity) / peak).max(0.0),
            (Some(_), Some(_)) => 1.0,
            _ => 0.0,
        }
    }

    fn daily_loss(&self) -> f64 {
        match self.last_equity {
            Some(equity) if self.day_start_equity > 0.0 => {
                ((self.day_start_equity - equity) / self.day_start_equity).max(0.0)
            }
            _ => 0.0,
        }
    }

    pub fn peak_equity(&self) -> Option<f64> {
        self.peak_equity
    }

    pub fn is_tripped(&self) -> bool {
        self.drawdown_tripped || self.daily_tripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_portfolio_drawdown: 0.20,
            drawdown_recovery_threshold: 0.10,
            // Out of the way for the drawdown tests
            max_daily_loss: 0.90,
            ..RiskLimits::default()
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_circuit_breaker_ok() {
        let mut breaker = DrawdownBreaker::new(&limits());
        assert!(breaker.observe(10_000.0, noon()).is_empty());
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_circuit_breaker_drawdown() {
        let mut breaker = DrawdownBreaker::new(&limits());
        breaker.observe(12_000.0, noon());

        // Peak was 12000, now 9000 = 25% drawdown
        let transitions = breaker.observe(9_000.0, noon());
        assert!(matches!(
            transitions.as_slice(),
            [BreakerTransition::Tripped(BreakerTrip {
                kind: BreakerKind::Drawdown,
                ..
            })]
        ));
        assert_eq!(breaker.check().unwrap_err().kind, BreakerKind::Drawdown);
    }

    #[test]
    fn test_exactly_at_limit_does_not_trip() {
        let mut breaker = DrawdownBreaker::new(&limits());
        breaker.observe(10_000.0, noon());
        breaker.observe(8_000.0, noon());
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_hysteresis_holds_until_recovery_threshold() {
        let mut breaker = DrawdownBreaker::new(&limits());
        breaker.observe(10_000.0, noon());
        breaker.observe(7_500.0, noon());
        assert!(breaker.is_tripped());

        // 15% drawdown: below the trip level but above the recovery level
        assert!(breaker.observe(8_500.0, noon()).is_empty());
        assert!(breaker.check().is_err());

        // 10% drawdown resets
        let transitions = breaker.observe(9_000.0, noon());
        assert!(matches!(
            transitions.as_slice(),
            [BreakerTransition::Reset(_)]
        ));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_circuit_breaker_daily_loss() {
        let limits = RiskLimits {
            max_daily_loss: 0.05,
            ..limits()
        };
        let mut breaker = DrawdownBreaker::new(&limits);
        breaker.observe(10_000.0, noon());

        // Simulate -6% daily loss
        let transitions = breaker.observe(9_400.0, noon() + Duration::hours(1));
        assert!(matches!(
            transitions.as_slice(),
            [BreakerTransition::Tripped(BreakerTrip {
                kind: BreakerKind::DailyLoss,
                ..
            })]
        ));
        assert_eq!(breaker.check().unwrap_err().kind, BreakerKind::DailyLoss);

        // Next UTC day starts from the current equity
        let transitions = breaker.observe(9_400.0, noon() + Duration::days(1));
        assert!(matches!(
            transitions.as_slice(),
            [BreakerTransition::Reset(BreakerTrip {
                kind: BreakerKind::DailyLoss,
                ..
            })]
        ));
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_non_finite_equity_is_ignored() {
        let mut breaker = DrawdownBreaker::new(&limits());
        breaker.observe(10_000.0, noon());
        assert!(breaker.observe(f64::NAN, noon()).is_empty());
        assert_eq!(breaker.drawdown(), 0.0);
    }
}
