use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const DEFAULT_FILTER: &str = "tradeloop=info";
pub const HEARTBEAT_TARGET: &str = "tradeloop::heartbeat";

/// Count of events the logging pipeline has dispatched
#[derive(Clone, Default)]
pub struct Heartbeat {
    count: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Emit a heartbeat event through the subscriber
    pub fn beat(&self) {
        tracing::trace!(target: HEARTBEAT_TARGET, "heartbeat");
    }

    pub fn layer(&self) -> HeartbeatLayer {
        HeartbeatLayer {
            count: self.count.clone(),
        }
    }
}

/// Layer bumping the [`Heartbeat`] counter for every event it sees
pub struct HeartbeatLayer {
    count: Arc<AtomicU64>,
}

impl<S: Subscriber> Layer<S> for HeartbeatLayer {
    fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Install the global subscriber
///
/// The fmt layer honours `RUST_LOG` (falling back to `tradeloop=info`); the
/// heartbeat layer sees every event from this crate regardless.
pub fn init() -> anyhow::Result<Heartbeat> {
    let heartbeat = Heartbeat::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .with(
            heartbeat
                .layer()
                .with_filter(Targets::new().with_target("tradeloop", Level::TRACE)),
        )
        .try_init()?;

    Ok(heartbeat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_counts_events() {
        let heartbeat = Heartbeat::new();
        let subscriber = tracing_subscriber::registry().with(
            heartbeat
                .layer()
                .with_filter(Targets::new().with_target("tradeloop", Level::TRACE)),
        );

        tracing::subscriber::with_default(subscriber, || {
            heartbeat.beat();
            heartbeat.beat();
            tracing::info!(target: "other_crate", "ignored");
        });

        assert_eq!(heartbeat.count(), 2);
    }

    #[test]
    fn test_heartbeat_without_subscriber_stays_flat() {
        let heartbeat = Heartbeat::new();
        heartbeat.beat();
        assert_eq!(heartbeat.count(), 0);
    }
}
