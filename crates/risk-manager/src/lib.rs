//! Risk Manager
//!
//! Circuit breaker, trailing-stop exits, position sizing and alert
//! deduplication, tied together by the decision coordinator.

pub mod alert_dedup;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod exit_controller;
pub mod sizing;

pub use alert_dedup::{AlertDeduplicator, DedupConfig, DedupStats};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerEngine};
pub use config::GuardConfig;
pub use coordinator::RiskDecisionCoordinator;
pub use exit_controller::{ExitConfig, PositionExitController};
pub use sizing::{kelly_fraction, SizingConfig};
