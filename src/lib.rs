// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod domain;
pub mod executor;
pub mod feed;
pub mod gateway;
pub mod metrics;
pub mod notifier;
pub mod positions;
pub mod recorder;
pub mod risk;
pub mod runner;
pub mod strategy;

pub use executor::{EscapeOutcome, ExecError, OrderExecutor};
pub use positions::{PortfolioLedger, PortfolioSnapshot, MAX_POSITIONS};
pub use risk::{PositionSizer, RiskManager};
pub use runner::{EngineStatus, ExecutionLoop};
