// Order lifecycle, execution and position tracking
pub mod executor;
pub mod order;
pub mod position_tracker;

pub use executor::{CloseReport, ExecutionOutcome, Fill, OrderExecutor};
pub use order::{Order, OrderRole, OrderState};
pub use position_tracker::{
    CloseRequest, PendingClose, Position, PositionTracker, Protection, ReconciledClose,
    StopUpdate,
};
