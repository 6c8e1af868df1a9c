//! # Error Types
//!
//! Custom error types for the OBD collector using `thiserror`.

use thiserror::Error;

/// Main error type for the OBD collector
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Device never reported a car connection within the retry budget
    #[error("OBD connection not established after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    /// Probing left no supported parameter
    #[error("no OBD parameter supported by the connected vehicle")]
    CapabilityEmpty,

    /// Session is not active or the name is not part of the active set
    #[error("query unavailable: {0}")]
    QueryUnavailable(String),

    /// Write queue full, the line was dropped
    #[error("write queue saturated ({capacity} lines), record dropped")]
    WriteQueueSaturated { capacity: usize },

    /// Upload of a single trip file failed
    #[error("upload of {file} failed: {reason}")]
    UploadFailed { file: String, reason: String },

    /// Notification endpoint could not be reached or answered non-200
    #[error("notification endpoint unreachable: {0}")]
    NotificationUnreachable(String),

    /// Notification retry budget exhausted
    #[error("notification for {key} abandoned after {attempts} attempts")]
    NotificationExhausted { key: String, attempts: u32 },

    /// Command surface client sent a wrong secret
    #[error("command client authentication failed")]
    AuthenticationFailed,

    /// Diagnostic adapter errors
    #[error("OBD device error: {0}")]
    Device(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// No serial device could be opened
    #[error("Serial port not found (tried: {0})")]
    SerialPortNotFound(String),

    /// Endpoint URL could not be used
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    /// gpsd stream errors
    #[error("Positioning error: {0}")]
    Positioning(String),

    /// Object store errors
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the OBD collector
pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = CollectorError::ConnectionExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "OBD connection not established after 3 attempts");

        let err = CollectorError::UploadFailed {
            file: "a.csv".to_string(),
            reason: "denied".to_string(),
        };
        assert!(err.to_string().contains("a.csv"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CollectorError = io.into();
        assert!(matches!(err, CollectorError::Io(_)));
    }
}
