// Core modules
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod health;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{run_engine, ShutdownSignal};
pub use error::{EngineError, ExchangeError, OrderError};
pub use models::*;
pub use strategy::Strategy;
