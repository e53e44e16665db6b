//! Error types for the vdiexport core library.

use std::path::PathBuf;

/// The main error type for vdiexport operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Login was refused or the session was rejected later on.
    #[error("authentication error: {message}")]
    Auth { message: String },

    /// Transport failure or unexpected response from the management API.
    #[error("management API error: {message}")]
    Api { message: String },

    /// The VM, or its root volume, could not be found.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// A bounded wait ran past its deadline.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// The guest could not run a command within the retry budget.
    #[error("guest unreachable after {attempts} attempt(s) running '{command}': {message}")]
    GuestUnreachable {
        command: String,
        attempts: u32,
        message: String,
    },

    /// The VM could not be brought to a stopped state.
    #[error("shutdown error: {message}")]
    Shutdown { message: String },

    /// The disk conversion tool is missing or unusable.
    #[error("conversion tool not found: {message}")]
    ToolNotFound { message: String },

    /// An output path already exists and would be overwritten.
    #[error("output already exists: '{}'", path.display())]
    OutputCollision { path: PathBuf },

    /// Not enough free space at the destination filesystem.
    #[error("insufficient space at '{}': required {required} bytes, available {available} bytes", path.display())]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// An external conversion exited abnormally or its output is unusable.
    #[error("conversion failed: {message}")]
    ConversionFailed { message: String },

    /// Invalid configuration or command-line input.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The operator interrupted the run.
    #[error("cancelled by operator")]
    Cancelled,
}

/// A specialized Result type for vdiexport operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a management API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a guest-unreachable error.
    pub fn guest_unreachable(
        command: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::GuestUnreachable {
            command: command.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a shutdown error.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Create a tool-not-found error.
    pub fn tool_not_found(message: impl Into<String>) -> Self {
        Self::ToolNotFound {
            message: message.into(),
        }
    }

    /// Create an output collision error.
    pub fn output_collision(path: impl Into<PathBuf>) -> Self {
        Self::OutputCollision { path: path.into() }
    }

    /// Create an insufficient space error.
    pub fn insufficient_space(path: impl Into<PathBuf>, required: u64, available: u64) -> Self {
        Self::InsufficientSpace {
            path: path.into(),
            required,
            available,
        }
    }

    /// Create a conversion failure error.
    pub fn conversion_failed(message: impl Into<String>) -> Self {
        Self::ConversionFailed {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/data/vm-1.img");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/data/vm-1.img"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_guest_unreachable_error() {
        let err = Error::guest_unreachable("fstrim /", 3, "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("fstrim /"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_insufficient_space_error() {
        let err = Error::insufficient_space("/work", 200, 100);
        let msg = err.to_string();
        assert!(msg.contains("/work"));
        assert!(msg.contains("required 200"));
        assert!(msg.contains("available 100"));
    }

    #[test]
    fn test_output_collision_error() {
        let err = Error::output_collision("/work/prod.vdi");
        assert!(err.to_string().contains("/work/prod.vdi"));
    }

    #[test]
    fn test_auth_error() {
        let err = Error::auth("bad credentials");
        assert!(err.to_string().contains("authentication error"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
