//! Protocol error types

use thiserror::Error;

/// Relay protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed JSON envelope
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope named an event this side does not handle
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload did not match the shape the event expects
    #[error("Invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// Line exceeds maximum allowed size
    #[error("Line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },

    /// I/O error during line operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownEvent("reboot".to_string());
        assert_eq!(format!("{}", err), "Unknown event: reboot");
    }

    #[test]
    fn test_line_too_long_error() {
        let err = ProtocolError::LineTooLong {
            size: 10_000_000,
            max: 1_048_576,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Line too long"));
        assert!(msg.contains("1048576"));
    }
}
