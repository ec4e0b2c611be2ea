//! Errors that stop a cycle.

use crate::config::ConfigError;
use crate::controllers::ControllerError;

/// Why a board or a whole cycle could not proceed.
///
/// Mechanical faults carry the board position so the operator can retry or
/// skip exactly that board.
#[derive(Debug, thiserror::Error)]
pub enum ProgBotError {
    #[error("probe failed on board [{col}, {row}]: {source}")]
    ProbeFailed {
        col: u32,
        row: u32,
        #[source]
        source: ControllerError,
    },

    #[error("unexpected contact above board [{col}, {row}] at safe height")]
    UnexpectedContact { col: u32, row: u32 },

    #[error("no contact with board [{col}, {row}] after {attempts} Y adjustment(s)")]
    NoContact { col: u32, row: u32, attempts: usize },

    #[error("board [{col}, {row}] is outside the {cols}x{rows} panel")]
    OutOfPanel {
        col: u32,
        row: u32,
        cols: u32,
        rows: u32,
    },

    #[error("hardware error: {0}")]
    Controller(#[from] ControllerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cycle cancelled")]
    Cancelled,
}

impl ProgBotError {
    /// Faults that leave the board in an unknown physical state.
    pub fn is_mechanical(&self) -> bool {
        matches!(
            self,
            Self::ProbeFailed { .. } | Self::UnexpectedContact { .. } | Self::NoContact { .. }
        )
    }
}

/// Result type for orchestrator operations.
pub type ProgBotResult<T> = std::result::Result<T, ProgBotError>;
