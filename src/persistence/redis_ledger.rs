use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::JournalError;

const KEY: &str = "tradeloop:restarts";

/// Mirror of the restart ledger in Redis
///
/// Sorted set keyed by restart time, so a freshly executed binary still sees
/// restarts an earlier process made within the window.
pub struct RedisLedgerMirror {
    conn: ConnectionManager,
    key: String,
}

impl RedisLedgerMirror {
    pub async fn connect(redis_url: &str) -> Result<Self, JournalError> {
        Self::connect_with_key(redis_url, KEY).await
    }

    pub async fn connect_with_key(redis_url: &str, key: &str) -> Result<Self, JournalError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| JournalError::Unavailable("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis restart ledger at {}", redis_url);

        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }

    pub async fn record(&self, at: DateTime<Utc>) -> Result<(), JournalError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(&self.key, at.to_rfc3339(), at.timestamp_millis() as f64)
            .await?;
        Ok(())
    }

    /// Restarts at or after `since`, oldest first
    pub async fn load(&self, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, JournalError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .zrangebyscore(&self.key, since.timestamp_millis() as f64, "+inf")
            .await?;

        let restarts = raw
            .iter()
            .filter_map(|s| match DateTime::parse_from_rfc3339(s) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(err) => {
                    tracing::warn!(value = %s, error = %err, "Skipping unreadable restart entry");
                    None
                }
            })
            .collect();
        Ok(restarts)
    }

    /// Remove restarts older than `before`
    pub async fn prune(&self, before: DateTime<Utc>) -> Result<usize, JournalError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .zrembyscore(&self.key, "-inf", format!("({}", before.timestamp_millis()))
            .await?;
        if removed > 0 {
            tracing::debug!("Pruned {} restart entries", removed);
        }
        Ok(removed)
    }
}
