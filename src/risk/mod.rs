// Risk management module
pub mod circuit_breakers;
pub mod manager;
pub mod volatility;

pub use circuit_breakers::{BreakerKind, BreakerTransition, BreakerTrip, DrawdownBreaker};
pub use manager::{RiskManager, RiskOutcome, RiskViolation, SizedOrder};
