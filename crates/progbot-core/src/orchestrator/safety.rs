//! Bringing the head back to a safe state.
//!
//! Every board exit path, success or failure, goes through [`make_safe`].
//! Cancellation drops the board future instead, so the cycle-level cleanup
//! retracts once more before parking.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controllers::{ControllerResult, HeadControl, MotionControl};
use crate::obs::emit_cleanup_error;

/// Z of the safe travel plane.
pub const SAFE_Z: f64 = 0.0;

/// Settle time after switching head power or logic.
pub const POWER_SETTLE: Duration = Duration::from_secs(1);

/// What the current board has done to the head so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeadState {
    pub powered: bool,
    pub lowered: bool,
}

/// Power the head down if it was powered, then retract to [`SAFE_Z`].
///
/// Both steps are attempted even if the first fails; the first error is
/// returned.
pub async fn make_safe(
    motion: &dyn MotionControl,
    head: &dyn HeadControl,
    state: &mut HeadState,
) -> ControllerResult<()> {
    let mut first_err = None;

    if state.powered {
        match head.set_all(false).await {
            Ok(()) => {
                state.powered = false;
                tokio::time::sleep(POWER_SETTLE).await;
            }
            Err(e) => {
                emit_cleanup_error("head_power_off", &e);
                first_err = Some(e);
            }
        }
    }

    match motion.rapid_z_abs(SAFE_Z).await {
        Ok(()) => {
            state.lowered = false;
            debug!("head retracted");
        }
        Err(e) => {
            emit_cleanup_error("retract", &e);
            first_err.get_or_insert(e);
        }
    }

    first_err.map_or(Ok(()), Err)
}

/// Aborts the wrapped task when dropped, so a background task never
/// outlives the board that started it.
pub struct AbortOnDrop<T>(pub JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            debug!("aborting background task");
        }
        self.0.abort();
    }
}

impl<T> AbortOnDrop<T> {
    /// Whether the task already ended on its own (for example with an error).
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

/// Log a background task that ended early.
pub fn report_early_exit(name: &str) {
    warn!(task = name, "background task ended before its window closed");
}
