//! Intraday Guard: circuit breaker and trailing-exit risk control for intraday equities
//!
//! This is the root crate that provides benchmark and integration-test access to
//! the internal crates:
//!
//! - `guard-core`: Shared types (snapshots, events, decisions, alerts, locks) and errors
//! - `risk-manager`: Circuit breaker, exit controller, sizing, alert dedup, coordinator
//! - `risk-monitor`: JSON-lines scan-loop host binary

// Re-export for benchmarks
pub use guard_core as core;
pub use risk_manager as risk;
