// Liveness checks, reconnection and restart bookkeeping
pub mod backoff;
pub mod controller;
pub mod ledger;
pub mod memory;

pub use backoff::Backoff;
pub use controller::{HealthController, HealthStatus, HealthVerdict};
pub use ledger::RestartLedger;
pub use memory::{FixedMemory, MemorySource, ProcMeminfo};
