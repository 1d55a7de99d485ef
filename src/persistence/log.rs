use async_trait::async_trait;

use super::{Journal, JournalError};
use crate::models::{HealthEvent, TradeRecord};

/// Journal that only writes structured log lines
pub struct LogJournal;

#[async_trait]
impl Journal for LogJournal {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), JournalError> {
        tracing::info!(
            target: "tradeloop::journal",
            position_id = %trade.position_id,
            symbol = %trade.symbol,
            side = %trade.side,
            size = trade.size,
            entry = trade.entry_price,
            exit = trade.exit_price,
            pnl = trade.realized_pnl,
            reason = trade.reason.as_str(),
            "Trade closed"
        );
        Ok(())
    }

    async fn record_health_event(&self, event: &HealthEvent) -> Result<(), JournalError> {
        tracing::info!(
            target: "tradeloop::journal",
            kind = event.kind.as_str(),
            detail = %event.detail,
            at = %event.timestamp,
            "Health event"
        );
        Ok(())
    }
}
