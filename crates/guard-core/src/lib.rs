//! Guard Core Library
//!
//! Shared types and errors for the intraday risk guard: position snapshots,
//! defense results, instrument locks, alerts and coordinator decisions.

pub mod error;
pub mod types;

pub use error::{Error, Result};
