//! Error types for vtytousb
//!
//! One error type shared by the server and its utilities.

use std::path::PathBuf;

/// Main error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Device Errors ===

    #[error("Serial device {path}: {message}")]
    Device { path: String, message: String },

    // === Network Errors ===

    #[error("Failed to bind port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Host key error: {0}")]
    HostKey(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device error for the given device path
    pub fn device(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Device {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an SSH error
    pub fn ssh(msg: impl Into<String>) -> Self {
        Self::Ssh(msg.into())
    }

    /// Create a host key error
    pub fn host_key(msg: impl Into<String>) -> Self {
        Self::HostKey(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the gateway keeps running after this error
    ///
    /// Config, device and network failures are scoped to one store, bridge
    /// or connection. Everything else escapes to `main`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigInvalid { .. }
                | Self::Device { .. }
                | Self::Bind { .. }
                | Self::Ssh(_)
        )
    }
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = GatewayError::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_file_write() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = GatewayError::FileWrite {
            path: PathBuf::from("/data/serials/ttyUSB0.json"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to write file"));
        assert!(msg.contains("ttyUSB0.json"));
    }

    #[test]
    fn test_error_display_config_invalid() {
        let err = GatewayError::ConfigInvalid {
            path: PathBuf::from("/data/config.json"),
            message: "expected value at line 1 column 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("config.json"));
        assert!(msg.contains("line 1"));
    }

    #[test]
    fn test_error_display_device() {
        let err = GatewayError::device("/dev/ttyUSB0", "No such file or directory");
        assert_eq!(
            err.to_string(),
            "Serial device /dev/ttyUSB0: No such file or directory"
        );
    }

    #[test]
    fn test_error_display_bind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = GatewayError::Bind {
            port: 5000,
            source: io_err,
        };
        assert!(err.to_string().contains("Failed to bind port 5000"));
    }

    #[test]
    fn test_error_display_ssh() {
        let err = GatewayError::ssh("handshake failed");
        assert_eq!(err.to_string(), "SSH error: handshake failed");
    }

    // ==================== Recoverable Tests ====================

    #[test]
    fn test_recoverable_categories() {
        assert!(GatewayError::config("bad").is_recoverable());
        assert!(GatewayError::device("/dev/ttyS0", "gone").is_recoverable());
        assert!(GatewayError::ssh("reset").is_recoverable());
        assert!(GatewayError::ConfigInvalid {
            path: PathBuf::from("/x.json"),
            message: "oops".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_not_recoverable() {
        assert!(!GatewayError::internal("invariant violated").is_recoverable());
        assert!(!GatewayError::host_key("unreadable").is_recoverable());
    }

    // ==================== From Trait Tests ====================

    #[test]
    fn test_from_io_error_preserves_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: GatewayError = io_err.into();
        if let GatewayError::Io(inner) = err {
            assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied);
        } else {
            panic!("Expected Io variant");
        }
    }
}
