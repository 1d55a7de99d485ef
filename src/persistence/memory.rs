use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Journal, JournalError};
use crate::models::{HealthEvent, TradeRecord};

/// Journal kept in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryJournal {
    trades: Mutex<Vec<TradeRecord>>,
    events: Mutex<Vec<HealthEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.trades.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn health_events(&self) -> Vec<HealthEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), JournalError> {
        self.trades
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trade.clone());
        Ok(())
    }

    async fn record_health_event(&self, event: &HealthEvent) -> Result<(), JournalError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
