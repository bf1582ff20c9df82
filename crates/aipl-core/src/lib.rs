//! Shared types for the AIPL execution engine: tasks, checks, runs, events,
//! identifiers, environment configuration, and small filesystem helpers.

pub mod env;
pub mod error;
pub mod fsio;
pub mod ids;
pub mod layout;
pub mod reason;
pub mod state;
pub mod types;

pub use error::AppError;
pub use reason::Reason;

use chrono::Utc;

/// Current time as fractional unix seconds, the timestamp unit used in every
/// artifact this engine writes.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
