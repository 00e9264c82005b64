//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Channel could not be established or the connect handshake failed
    Connection(String),

    /// Malformed frame, unknown message kind, or other protocol violation
    Protocol(String),

    /// A put/get operation failed against a specific remote path
    Transfer {
        /// Operation that failed ("put", "get", "stat", ...)
        op: String,
        /// Remote path the operation targeted
        path: String,
        /// Underlying failure message, preserved verbatim
        message: String,
    },

    /// The session was torn down while the operation was pending
    SessionClosed,

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Transfer { op, path, message } => {
                write!(f, "{} {}: {}", op, path, message)
            }
            SkiffError::SessionClosed => write!(f, "Session closed"),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::Connection("handshake timed out".to_string());
        assert_eq!(err.to_string(), "Connection error: handshake timed out");
    }

    #[test]
    fn test_transfer_error_preserves_message() {
        let err = SkiffError::Transfer {
            op: "put".to_string(),
            path: "/upload/bad-directory/file.txt".to_string(),
            message: "No such file".to_string(),
        };
        assert!(err.to_string().contains("No such file"));
        assert!(err.to_string().contains("/upload/bad-directory/file.txt"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let skiff_err: SkiffError = io_err.into();
        assert!(matches!(skiff_err, SkiffError::Io(_)));
    }

    #[test]
    fn test_session_closed_display() {
        assert_eq!(SkiffError::SessionClosed.to_string(), "Session closed");
    }
}
