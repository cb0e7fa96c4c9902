//! Error types for gsg

use thiserror::Error;

/// Result type alias for gsg operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gsg
#[derive(Error, Debug)]
pub enum Error {
    /// Credentials or backend initialization failed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Object or prefix does not exist
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Local CRC32C differs from what the backend reported
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    /// Lock is held by someone else and has not expired
    #[error("Lock conflict at {path}")]
    LockConflict { path: String },

    /// Unlock attempted with a stale or missing token
    #[error("Lock token mismatch at {path}: {reason}")]
    LockTokenMismatch { path: String, reason: String },

    /// Operation not available on this backend
    #[error("Unsupported operation: {operation} on {backend}")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Opaque provider failure
    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid locator string
    #[error("Invalid locator: {locator} - {reason}")]
    InvalidLocator { locator: String, reason: String },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Worker pool closed, or a job ended without reporting
    #[error("Worker error: {message}")]
    Worker { message: String },
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a worker error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// True for the error produced by cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::ChecksumMismatch {
            path: "/tmp/a".to_string(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch for /tmp/a: expected 1, got 2"
        );

        let err = Error::Unsupported {
            operation: "download",
            backend: "local",
        };
        assert!(err.to_string().contains("download"));
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_cancelled());
        assert!(Error::Cancelled.is_cancelled());
    }
}
