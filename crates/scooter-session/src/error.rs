//! Error types for scooter session operations
//!
//! Most failures in the session core are not surfaced as errors at all: a
//! dropped link becomes a `Disconnected` transition and a frame that fails
//! decryption is discarded. The variants below cover the places where a
//! caller or a transport implementation still needs a `Result`.

use thiserror::Error;

/// Main error type for scooter session operations
#[derive(Error, Debug)]
pub enum SessionError {
    // ===== Transport Errors =====
    /// No usable Bluetooth adapter on this host
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Peripheral is not known to the transport
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    /// Connecting to the peripheral failed
    #[error("Failed to connect to {device}: {reason}")]
    ConnectFailed {
        /// Device name
        device: String,
        /// Failure reason
        reason: String,
    },

    /// A required GATT characteristic was not exposed by the peripheral
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Characteristic write error
    #[error("Write error: {0}")]
    WriteError(String),

    /// Operation needs a live connection
    #[error("Not connected")]
    NotConnected,

    /// Transport-level backend error
    #[error("Transport error: {0}")]
    Transport(String),

    // ===== Protocol Errors =====
    /// Frame did not match any known framing
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame payload exceeds the one-byte length field
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // ===== General Errors =====
    /// Session controller has stopped
    #[error("Channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectFailed { .. }
                | SessionError::NotConnected
                | SessionError::WriteError(_)
                | SessionError::Transport(_)
        )
    }

    /// Check if this is a protocol error (bad data from the scooter)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidFrame(_) | SessionError::FrameTooLarge { .. }
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::NoAdapter => "NO_ADAPTER",
            SessionError::PeripheralNotFound(_) => "PERIPHERAL_NOT_FOUND",
            SessionError::ConnectFailed { .. } => "CONNECT_FAILED",
            SessionError::CharacteristicNotFound(_) => "CHARACTERISTIC_NOT_FOUND",
            SessionError::WriteError(_) => "WRITE_ERROR",
            SessionError::NotConnected => "NOT_CONNECTED",
            SessionError::Transport(_) => "TRANSPORT_ERROR",
            SessionError::InvalidFrame(_) => "INVALID_FRAME",
            SessionError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            SessionError::InvalidConfig(_) => "INVALID_CONFIG",
            SessionError::ConfigParse(_) => "CONFIG_PARSE",
            SessionError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SessionError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SessionError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SessionError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        SessionError::ChannelClosed
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for SessionError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => SessionError::PeripheralNotFound(err.to_string()),
            btleplug::Error::NotConnected => SessionError::NotConnected,
            other => SessionError::Transport(other.to_string()),
        }
    }
}
