//! Error types for pool and scheduler operations

use chrono::{DateTime, Utc};

/// Errors from pool and scheduler operations.
///
/// `NoEligibleCredential` is internal to the scheduler; `submit` surfaces only
/// `Exhausted`, `Failed`, `PermanentContent` and `Cancelled`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no eligible credential")]
    NoEligibleCredential,

    #[error("all credentials exhausted ({})", describe_retry(*retry_at))]
    Exhausted {
        /// Unix milliseconds at which a credential becomes eligible again,
        /// None when every credential is disabled
        retry_at: Option<u64>,
    },

    #[error("request failed after {attempts} dispatches: {reason}")]
    Failed { attempts: u32, reason: String },

    #[error("{item} cannot be processed: {reason}")]
    PermanentContent { item: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("duplicate credential: {0}")]
    Duplicate(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}

fn describe_retry(retry_at: Option<u64>) -> String {
    match retry_at.and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)) {
        Some(at) => format!("retry after {}", at.to_rfc3339()),
        None => "all credentials disabled".to_string(),
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
