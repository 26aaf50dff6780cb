//! Error types for turnstile
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (broken connections, creation failures, timeouts)
//! - Non-retriable errors (closed pool, invalid configuration)

use std::fmt;
use thiserror::Error;

/// Result type for turnstile operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Link-level connection failure; the connection is considered broken
    Connection,
    /// Statement-level failure; the connection itself is still usable
    Query,
    /// The driver refused to open a raw connection
    CreateFailed,
    /// Admission or hand-off deadline expired (retriable)
    Timeout,
    /// The caller was interrupted while waiting
    Interrupt,
    /// The pool has been closed or is being cleared
    PoolClosed,
    /// Init-time configuration check failed
    Config,
    /// Driver capability not supported
    Unsupported,
    /// Internal invariant violation
    Internal,
}

impl ErrorKind {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::CreateFailed | Self::Timeout)
    }
}

/// Main error type for turnstile
#[derive(Error, Debug)]
pub enum Error {
    /// Link-level connection failure
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed without breaking the connection
    #[error("query error: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The connection factory failed to produce a raw connection
    #[error("failed to create connection: {message}")]
    CreateFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Waited longer than the configured maximum for a connection
    #[error("request timeout after {waited_ms}ms")]
    RequestTimeout { waited_ms: u64 },

    /// The waiting caller was interrupted by the pool
    #[error("request interrupted while waiting for a connection")]
    RequestInterrupt,

    /// Pool is closed or clearing; no new acquires may succeed
    #[error("pool has been closed or is being cleared")]
    PoolClosed,

    /// Configuration error detected at init time
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// Driver capability probe failed
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Query { .. } => ErrorKind::Query,
            Self::CreateFailed { .. } => ErrorKind::CreateFailed,
            Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::RequestInterrupt => ErrorKind::Interrupt,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::ConfigInvalid { .. } => ErrorKind::Config,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Create a link-level connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a link-level connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a statement-level error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            source: None,
        }
    }

    /// Create a creation failure carrying the underlying cause
    pub fn create_failed(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CreateFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a creation failure without a cause
    pub fn create_failed_msg(message: impl Into<String>) -> Self {
        Self::CreateFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a request-timeout error
    pub fn request_timeout(waited_ms: u64) -> Self {
        Self::RequestTimeout { waited_ms }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create an unsupported-capability error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::CreateFailed => write!(f, "create_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Interrupt => write!(f, "interrupt"),
            Self::PoolClosed => write!(f, "pool_closed"),
            Self::Config => write!(f, "config"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
