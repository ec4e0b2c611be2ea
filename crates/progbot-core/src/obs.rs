//! Structured observability hooks for the production cycle.
//!
//! This module provides:
//! - Cycle-scoped tracing spans via `CycleSpan`
//! - Emission functions for lifecycle events: cycle start and finish, board
//!   outcome, provisioning result, cleanup failures
//!
//! Events are emitted at `info!` level (filter with `PROGBOT_LOG`).

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, Instrument};

/// Cycle-scoped tracing span.
///
/// The cycle is async, so the span is attached to the cycle future rather
/// than held entered across await points:
///
/// ```ignore
/// let span = CycleSpan::new("3f1c...");
/// span.instrument(run_cycle()).await; // every event inside carries cycle_id
/// ```
#[derive(Debug, Clone)]
pub struct CycleSpan {
    span: tracing::Span,
}

impl CycleSpan {
    pub fn new(cycle_id: &str) -> Self {
        Self {
            span: tracing::info_span!("progbot.cycle", cycle_id = %cycle_id),
        }
    }

    pub fn instrument<F: Future>(&self, future: F) -> Instrumented<F> {
        future.instrument(self.span.clone())
    }

    /// Enter for a synchronous section.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

/// Emit event: cycle started over `boards` enabled positions.
pub fn emit_cycle_started(cycle_id: &str, panel: &str, boards: u32) {
    info!(event = "cycle.started", cycle_id = %cycle_id, panel = %panel, boards = boards);
}

/// Emit event: cycle finished.
pub fn emit_cycle_finished(
    cycle_id: &str,
    duration_ms: u64,
    passed: u32,
    failed: u32,
    skipped: u32,
    success: bool,
) {
    info!(
        event = "cycle.finished",
        cycle_id = %cycle_id,
        duration_ms = duration_ms,
        passed = passed,
        failed = failed,
        skipped = skipped,
        success = success,
    );
}

/// Emit event: one board left the line.
pub fn emit_board_finished(col: u32, row: u32, outcome: &str, duration_ms: u64) {
    info!(
        event = "board.finished",
        col = col,
        row = row,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a provisioning script ran against a board.
pub fn emit_provision_finished(script: &str, success: bool, steps_completed: usize, elapsed_ms: u64) {
    info!(
        event = "provision.finished",
        script = %script,
        success = success,
        steps_completed = steps_completed,
        elapsed_ms = elapsed_ms,
    );
}

/// Emit event: a best-effort cleanup step failed (warning level).
pub fn emit_cleanup_error(stage: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "cycle.cleanup_error", stage = %stage, error = %error);
}
