//! Persistence port
//!
//! The engine never waits on storage. It hands trade records and health
//! events to a [`JournalHandle`], which enqueues them on a bounded channel; a
//! background writer drains the queue into whichever [`Journal`] is
//! configured. A full queue drops the record with a warning.

pub mod log;
pub mod memory;
pub mod postgres;
pub mod redis_ledger;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::{JournalKind, PersistenceSettings};
use crate::models::{HealthEvent, TradeRecord};

pub use log::LogJournal;
pub use memory::MemoryJournal;
pub use postgres::PostgresJournal;
pub use redis_ledger::RedisLedgerMirror;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), JournalError>;
    async fn record_health_event(&self, event: &HealthEvent) -> Result<(), JournalError>;
}

#[derive(Debug, Clone)]
pub enum JournalEntry {
    Trade(TradeRecord),
    Health(HealthEvent),
}

impl JournalEntry {
    fn label(&self) -> &'static str {
        match self {
            JournalEntry::Trade(_) => "trade",
            JournalEntry::Health(_) => "health event",
        }
    }
}

/// Cheap, cloneable sender side of the journal queue
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<JournalEntry>,
}

impl JournalHandle {
    pub fn record_trade(&self, trade: TradeRecord) {
        self.send(JournalEntry::Trade(trade));
    }

    pub fn record_health_event(&self, event: HealthEvent) {
        self.send(JournalEntry::Health(event));
    }

    fn send(&self, entry: JournalEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(entry = entry.label(), "Journal queue full, dropping record");
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::debug!(entry = entry.label(), "Journal writer stopped, dropping record");
            }
        }
    }
}

/// Start the background writer
///
/// The writer finishes once every handle has been dropped and the queue
/// is drained.
pub fn spawn_writer(journal: Arc<dyn Journal>, capacity: usize) -> (JournalHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let result = match &entry {
                JournalEntry::Trade(trade) => journal.record_trade(trade).await,
                JournalEntry::Health(event) => journal.record_health_event(event).await,
            };
            if let Err(err) = result {
                tracing::warn!(entry = entry.label(), error = %err, "Journal write failed");
            }
        }
        tracing::debug!("Journal writer finished");
    });

    (JournalHandle { tx }, task)
}

pub async fn build_journal(settings: &PersistenceSettings) -> Result<Arc<dyn Journal>, JournalError> {
    match settings.kind {
        JournalKind::Log => Ok(Arc::new(LogJournal)),
        JournalKind::Postgres => {
            let url = settings.database_url.as_deref().ok_or_else(|| {
                JournalError::Unavailable("persistence.database_url is not set".to_string())
            })?;
            Ok(Arc::new(PostgresJournal::connect(url).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthEventKind;

    #[tokio::test]
    async fn test_writer_drains_into_journal() {
        let journal = Arc::new(MemoryJournal::new());
        let (handle, task) = spawn_writer(journal.clone(), 8);

        handle.record_health_event(HealthEvent::new(HealthEventKind::Restart, "run 1 failed"));
        handle.record_health_event(HealthEvent::new(HealthEventKind::Reconnected, "ok"));
        drop(handle);
        task.await.unwrap();

        let kinds: Vec<_> = journal.health_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![HealthEventKind::Restart, HealthEventKind::Reconnected]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = JournalHandle { tx };

        handle.record_health_event(HealthEvent::new(HealthEventKind::MemoryHigh, "first"));
        handle.record_health_event(HealthEvent::new(HealthEventKind::MemoryHigh, "second"));
        drop(handle);

        let mut received = Vec::new();
        while let Some(JournalEntry::Health(event)) = rx.recv().await {
            received.push(event.detail);
        }
        assert_eq!(received, vec!["first".to_string()]);
    }
}
