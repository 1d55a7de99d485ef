use std::sync::{Arc, Mutex};

use crate::config::RiskLimits;
use crate::execution::PositionTracker;
use crate::risk::RiskManager;

/// Trading state that outlives a single engine run
///
/// Open positions and the equity circuit breakers carry over supervised
/// restarts, so a restarted run keeps managing what the failed run opened and
/// a tripped breaker stays tripped.
pub struct EngineState {
    pub risk: RiskManager,
    pub positions: PositionTracker,
}

impl EngineState {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            risk: RiskManager::new(limits),
            positions: PositionTracker::new(),
        }
    }

    pub fn shared(limits: RiskLimits) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(limits)))
    }
}
