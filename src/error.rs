//! Error types for query evaluation
//!
//! Every failure that crosses the public boundary of the crate carries an
//! [`ErrorKind`] and maps onto the HTTP status the transport layer reports.

use std::fmt;

use thiserror::Error;

/// Main error type for query evaluation
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed query constraints (invalid window, missing identifiers)
    #[error("Bad data: {0}")]
    BadData(String),

    /// Expression shape mismatch, request construction or merge failure
    #[error("Execution error: {0}")]
    Exec(String),

    /// Downstream metadata or search backend failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Caller is not allowed to read the requested data
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON decode failure on a backend response
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Worker pool submission or task failure
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

impl Error {
    /// Create a bad-data error
    pub fn bad_data(message: impl Into<String>) -> Self {
        Error::BadData(message.into())
    }

    /// Create an execution error
    pub fn exec(message: impl Into<String>) -> Self {
        Error::Exec(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Category of this error for programmatic handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadData(_) => ErrorKind::BadData,
            Error::Exec(_) | Error::Pool(_) => ErrorKind::Exec,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Internal(_) | Error::Configuration(_) | Error::Decode(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status reported to the caller
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

/// Categories of query errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed query parameters (400)
    BadData,
    /// Permission denied (403)
    Forbidden,
    /// Expression or merge failure (422)
    Exec,
    /// Backend or decode failure (500)
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadData => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::Exec => 422,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::BadData => write!(f, "bad_data"),
            ErrorKind::Forbidden => write!(f, "forbidden"),
            ErrorKind::Exec => write!(f, "execution"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool was closed before the task could be submitted
    #[error("pool '{0}' is closed")]
    Closed(&'static str),

    /// A submitted task panicked or was aborted
    #[error("task in pool '{pool}' failed: {message}")]
    TaskFailed {
        /// Pool name
        pool: &'static str,
        /// Join error description
        message: String,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
