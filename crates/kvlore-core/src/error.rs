//! Error types for kvlore.
//!
//! Two classes of failure exist and they are kept apart:
//!
//! - Recoverable runtime conditions (I/O, resource exhaustion, bad input)
//!   are returned as [`Error`] values and propagate with `?`.
//! - Invariant violations inside the allocator indexes or the staging lists
//!   are programmer errors. Those `panic!` at the point of detection and are
//!   never represented here.

use thiserror::Error;

/// Specialized Result type for kvlore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for kvlore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config {
        /// Detailed error message
        message: String,
        /// Optional source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Host memory allocation errors
    #[error("Memory error: {message}")]
    Memory {
        /// Detailed error message
        message: String,
        /// Requested bytes
        requested_bytes: Option<usize>,
    },

    /// Tensor or executor errors
    #[error("Tensor error: {message}")]
    Tensor {
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// KV cache errors (bad ranges, unmaterialized entries)
    #[error("Cache error: {message}")]
    Cache {
        /// Detailed error message
        message: String,
        /// Lane the error occurred on
        lane: Option<usize>,
    },

    /// Input validation errors
    #[error("Validation error: {message}")]
    Validation {
        /// Detailed error message
        message: String,
        /// Field that failed validation
        field: Option<String>,
    },

    /// Actor state file format errors
    #[error("Persist error: {message}")]
    Persist {
        /// Detailed error message
        message: String,
        /// Path involved if applicable
        path: Option<String>,
    },

    /// Unknown actor, lane or memory
    #[error("Not found: {what}")]
    NotFound {
        /// What was being looked up
        what: String,
    },

    /// Internal errors that are not invariant violations
    #[error("Internal error: {message}")]
    Internal {
        /// Detailed error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        /// Detailed error message
        message: String,
        /// Path involved if applicable
        path: Option<String>,
        /// Source error
        #[source]
        source: Option<std::io::Error>,
    },

    /// Unsupported operation
    #[error("Unsupported: {feature}")]
    Unsupported {
        /// Feature that is not supported
        feature: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
            requested_bytes: None,
        }
    }

    /// Create an allocation failure error with the requested size
    pub fn memory_allocation(message: impl Into<String>, requested: usize) -> Self {
        Self::Memory {
            message: message.into(),
            requested_bytes: Some(requested),
        }
    }

    /// Create a tensor error
    pub fn tensor(message: impl Into<String>) -> Self {
        Self::Tensor {
            message: message.into(),
            source: None,
        }
    }

    /// Create a tensor error with source
    pub fn tensor_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tensor {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            lane: None,
        }
    }

    /// Create a cache error on a given lane
    pub fn cache_on_lane(message: impl Into<String>, lane: usize) -> Self {
        Self::Cache {
            message: message.into(),
            lane: Some(lane),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a persistence format error
    pub fn persist(message: impl Into<String>) -> Self {
        Self::Persist {
            message: message.into(),
            path: None,
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an IO error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            path: None,
            source: Some(source),
        }
    }

    /// Create an IO error with path
    pub fn io_with_path(
        message: impl Into<String>,
        path: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        let path = path.into();
        Self::Io {
            message: format!("{}: {} ({})", message.into(), path, source),
            path: Some(path),
            source: Some(source),
        }
    }

    /// Create an unsupported feature error
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Attach a path to a persist or IO error
    pub fn with_path(self, path: impl Into<String>) -> Self {
        match self {
            Error::Persist { message, .. } => Error::Persist {
                message,
                path: Some(path.into()),
            },
            Error::Io { message, source, .. } => Error::Io {
                message,
                path: Some(path.into()),
                source,
            },
            other => other,
        }
    }

    /// Whether the failure leaves the session usable.
    ///
    /// Memory and internal errors terminate the request that hit them.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Memory { .. } | Error::Internal { .. })
    }

    /// Get the error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Memory { .. } => "MEMORY_ERROR",
            Error::Tensor { .. } => "TENSOR_ERROR",
            Error::Cache { .. } => "CACHE_ERROR",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Persist { .. } => "PERSIST_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: format!("JSON parsing error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context to an error with a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Internal {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Internal {
            message: f(),
            source: Some(Box::new(e)),
        })
    }
}
