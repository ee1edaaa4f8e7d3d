//! Error types for eeflash.

use std::io;
use thiserror::Error;

use crate::programmer::SessionState;
use crate::protocol::Status;

/// Result type for eeflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for eeflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The peer did not answer before the deadline.
    ///
    /// `partial` holds whatever arrived before the wait was abandoned.
    #[error("Timeout: {context} ({} bytes received)", partial.len())]
    Timeout {
        /// What the session was waiting for.
        context: String,
        /// Bytes received before the deadline expired.
        partial: Vec<u8>,
    },

    /// A status byte arrived where a specific one was mandatory.
    #[error("Protocol desync: expected {expected}, got {actual}")]
    ProtocolDesync {
        /// Status the session required.
        expected: Status,
        /// Status that was actually received.
        actual: Status,
    },

    /// The peer echoed a different image size than the one requested.
    #[error("Size mismatch: sent {sent:#010x}, device echoed {echoed:#010x}")]
    SizeMismatch {
        /// Size sent by the host.
        sent: u32,
        /// Size echoed by the device.
        echoed: u32,
    },

    /// The device refused a mandatory checkpoint.
    #[error("Device rejected {context}: {status}")]
    Rejected {
        /// Checkpoint that was refused.
        context: String,
        /// Status returned instead of ACK.
        status: Status,
    },

    /// A host session was driven through an illegal state change.
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the attempted change.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// Image failed local validation before anything was sent.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Signature exchange failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Device not responding or no usable port found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Operation was interrupted by the embedding application.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the peer went silent.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Bytes received before a timeout, if any.
    pub fn partial_data(&self) -> Option<&[u8]> {
        match self {
            Self::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
