//! Error types for the serial line layer.

/// Errors produced by a [`LineDevice`](super::LineDevice).
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("{port} is closed")]
    Closed { port: String },

    #[error("device {port} failed to respond after {attempts} attempt(s) (timeout={timeout_ms}ms)")]
    Timeout {
        port: String,
        attempts: u32,
        timeout_ms: u64,
    },

    #[error("i/o error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for line device operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
