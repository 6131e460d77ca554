//! Core domain types for the intraday risk guard.

pub mod alert;
pub mod decision;
pub mod lock;
pub mod position;

pub use alert::*;
pub use decision::*;
pub use lock::*;
pub use position::*;
