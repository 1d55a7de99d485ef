use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Candle width used for fetching bars and for aligning the trading cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Wire representation understood by the exchange connectors
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 180,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H2 => 7_200,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds() as u64)
    }

    /// Next candle close strictly after `now`, aligned to the epoch
    ///
    /// A 5m timeframe at 12:03:10 closes at 12:05:00; at exactly 12:05:00 the
    /// next close is 12:10:00.
    pub fn next_close_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.seconds();
        let ts = now.timestamp();
        let next = (ts.div_euclid(width) + 1) * width;
        DateTime::<Utc>::from_timestamp(next, 0).unwrap_or(now + Duration::seconds(width))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "2h" => Ok(Timeframe::H2),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {}", other)),
        }
    }
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bars for one symbol/timeframe as returned by a single fetch
///
/// Bars are ordered oldest first. A snapshot is never mutated after it is
/// produced; each cycle replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bars: Vec<Candle>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, bars: Vec<Candle>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            bars,
            fetched_at: Utc::now(),
        }
    }

    /// Close of the most recent bar
    pub fn last_price(&self) -> Option<f64> {
        self.bars.last().map(|c| c.close)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|c| c.close).collect()
    }
}

/// What the strategy wants to do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Side of the position this action would open, `None` for Hold
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell => Some(Side::Sell),
            Action::Hold => None,
        }
    }
}

/// Output of the strategy port for one symbol and one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    /// Absolute price distance from entry to the stop-loss
    pub stop_distance: Option<f64>,
    /// Absolute price distance from entry to the take-profit
    pub take_profit_distance: Option<f64>,
}

impl Decision {
    pub fn new(symbol: impl Into<String>, action: Action, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            symbol: symbol.into(),
            action,
            confidence,
            stop_distance: None,
            take_profit_distance: None,
        }
    }

    pub fn hold(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Action::Hold, 0.0)
    }

    pub fn with_stops(mut self, stop_distance: f64, take_profit_distance: f64) -> Self {
        self.stop_distance = Some(stop_distance);
        self.take_profit_distance = Some(take_profit_distance);
        self
    }
}

/// Order side; for positions `Buy` means long and `Sell` means short
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for long exposure, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP",
        }
    }
}

/// Account balance in the quote currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    /// Mark-to-market account equity
    pub total: f64,
    /// Cash available for new orders
    pub free: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    Manual,
    Liquidation,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TakeProfit => "TakeProfit",
            ExitReason::Signal => "Signal",
            ExitReason::Manual => "Manual",
            ExitReason::Liquidation => "Liquidation",
        }
    }
}

/// Closed round trip, handed to the persistence port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthEventKind {
    ConnectivityLost,
    Reconnected,
    MemoryHigh,
    CacheOverBound,
    LoggingStalled,
    Restart,
    RestartBudgetExhausted,
    CircuitBreakerTripped,
    CircuitBreakerReset,
}

impl HealthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthEventKind::ConnectivityLost => "ConnectivityLost",
            HealthEventKind::Reconnected => "Reconnected",
            HealthEventKind::MemoryHigh => "MemoryHigh",
            HealthEventKind::CacheOverBound => "CacheOverBound",
            HealthEventKind::LoggingStalled => "LoggingStalled",
            HealthEventKind::Restart => "Restart",
            HealthEventKind::RestartBudgetExhausted => "RestartBudgetExhausted",
            HealthEventKind::CircuitBreakerTripped => "CircuitBreakerTripped",
            HealthEventKind::CircuitBreakerReset => "CircuitBreakerReset",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: HealthEventKind,
    pub detail: String,
}

impl HealthEvent {
    pub fn new(kind: HealthEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        }
    }
}
