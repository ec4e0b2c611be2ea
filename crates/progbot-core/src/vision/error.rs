//! Error types for camera access.

/// Camera and decoder failures. The scan strategy treats these as a missed
/// attempt, never as a cycle error.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("decoder failed: {0}")]
    Decode(String),

    #[error("camera i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type VisionResult<T> = std::result::Result<T, VisionError>;
