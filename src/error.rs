//! Error types for txbulk.

use thiserror::Error;

use crate::credit::Budget;

/// Everything a bulk run can fail with.
///
/// `Clone` because the first fatal error is kept by the bulk and handed
/// back from [`Bulk::status`](crate::bulk::Bulk::status).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("work source failed: {0}")]
    Source(String),

    #[error("transaction open failed for {budget}: {reason}")]
    TxOpen { budget: Budget, reason: String },

    #[error("bulk has already been started")]
    AlreadyStarted,

    #[error("bulk has not completed yet")]
    InProgress,

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
