//! Library error type for the backtesting core.
//!
//! Use cases and the CLI wrap [`BacktestError`] with `anyhow::Context` for
//! operator-facing messages; internal code propagates it with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BacktestError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BacktestError {
    #[error("invalid configuration: {reason}")]
    Validation { reason: String },

    #[error("illegal state transition: {reason}")]
    Precondition { reason: String },

    #[error("not authorized to access this resource")]
    Authorization,

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    Duplicate { what: String },

    #[error("transient failure: {0}")]
    Transient(#[from] TransientSource),

    #[error("insufficient historical data: have {covered_seconds}s of {needed_seconds}s requested")]
    DataGap {
        covered_seconds: i64,
        needed_seconds: i64,
    },

    #[error("value for {field} overflowed storage precision and was clamped")]
    Overflow { field: String },
}

/// Wraps the concrete transient-failure causes so `BacktestError::Transient`
/// can carry `#[from]` conversions without becoming a kitchen-sink variant.
#[derive(Debug, Error)]
pub enum TransientSource {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("exchange request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for BacktestError {
    fn from(e: rusqlite::Error) -> Self {
        BacktestError::Transient(TransientSource::Sqlite(e))
    }
}

impl From<reqwest::Error> for BacktestError {
    fn from(e: reqwest::Error) -> Self {
        BacktestError::Transient(TransientSource::Http(e))
    }
}

impl From<std::io::Error> for BacktestError {
    fn from(e: std::io::Error) -> Self {
        BacktestError::Transient(TransientSource::Io(e))
    }
}

impl BacktestError {
    pub fn validation(reason: impl Into<String>) -> Self {
        BacktestError::Validation {
            reason: reason.into(),
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        BacktestError::Precondition {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BacktestError::NotFound { what: what.into() }
    }
}
