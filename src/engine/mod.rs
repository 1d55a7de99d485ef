//! Engine wiring: run loop, supervision and shutdown

pub mod context;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use context::OrchestratorContext;
pub use orchestrator::{CycleReport, Orchestrator};
pub use shutdown::ShutdownSignal;
pub use state::EngineState;
pub use supervisor::Supervisor;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Settings;
use crate::error::EngineError;
use crate::exchange::build_connector;
use crate::health::{ProcMeminfo, RestartLedger};
use crate::logging::Heartbeat;
use crate::persistence::{build_journal, spawn_writer, Journal, LogJournal, RedisLedgerMirror};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build everything from `settings` and supervise engine runs until shutdown
pub async fn run_engine(
    settings: Settings,
    shutdown: ShutdownSignal,
    heartbeat: Option<Heartbeat>,
) -> Result<(), EngineError> {
    let settings = Arc::new(settings);
    let connector = build_connector(&settings)?;

    let backend: Arc<dyn Journal> = match build_journal(&settings.persistence).await {
        Ok(journal) => journal,
        Err(err) => {
            tracing::warn!(error = %err, "Journal unavailable, falling back to log journal");
            Arc::new(LogJournal)
        }
    };
    let (journal, writer) = spawn_writer(backend, settings.persistence.queue_capacity);

    let mut ledger = RestartLedger::from_settings(&settings.health);
    let mirror = match settings.persistence.redis_url.as_deref() {
        Some(url) => match RedisLedgerMirror::connect(url).await {
            Ok(mirror) => {
                let since = Utc::now() - ledger.window();
                match mirror.load(since).await {
                    Ok(restarts) => {
                        tracing::info!(count = restarts.len(), "Restored restart ledger");
                        ledger.restore(restarts);
                    }
                    Err(err) => tracing::warn!(error = %err, "Could not read restart ledger mirror"),
                }
                if let Err(err) = mirror.prune(since).await {
                    tracing::debug!(error = %err, "Restart ledger prune failed");
                }
                Some(mirror)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Redis unavailable, restart ledger is process-local");
                None
            }
        },
        None => None,
    };

    let result = {
        let mut supervisor = Supervisor::new(
            settings.clone(),
            connector,
            ledger,
            shutdown,
            journal,
            Arc::new(ProcMeminfo::default()),
        );
        if let Some(heartbeat) = heartbeat {
            supervisor = supervisor.with_heartbeat(heartbeat);
        }
        if let Some(mirror) = mirror {
            supervisor = supervisor.with_mirror(mirror);
        }
        supervisor.run().await
    };

    // Every handle is gone with the supervisor, so the writer drains and ends
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::warn!("Journal writer did not drain in time");
    }

    result
}
