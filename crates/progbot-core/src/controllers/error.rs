//! Error types for the device controllers.

use crate::device::DeviceError;

/// Errors from motion, head, target and programmer controllers.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{device} answered {reply:?} to {command:?}, expected {expected:?}")]
    UnexpectedReply {
        device: &'static str,
        command: String,
        reply: String,
        expected: &'static str,
    },

    #[error("programmer head reported ERROR to {command:?}: {reply}")]
    HeadFault { command: String, reply: String },

    #[error("no probe distance received within {timeout_ms}ms")]
    ProbeTimeout { timeout_ms: u64 },

    #[error("malformed probe reply {line:?}")]
    ProbeParse { line: String },

    #[error("no position report within {timeout_ms}ms")]
    PositionTimeout { timeout_ms: u64 },

    #[error("`{command}` failed: {reason}")]
    Programmer { command: String, reason: String },
}

/// Result type for controller operations.
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;
