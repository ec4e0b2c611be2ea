//! The fixture's control loop.
//!
//! [`ProgBot`] owns the per-position [`BoardStatus`] records and drives the
//! hardware seams in [`Hardware`] one board at a time. It is the only
//! writer of board state; observers see snapshots through the
//! [`EventBus`].
//!
//! A cycle homes the stage, optionally scans every board for a QR code,
//! then runs the board sequence (see [`ProgBot::run_board`]) column-major,
//! rows ascending, before parking the stage and switching the motors off.
//! Cancellation and errors are cleaned up at the cycle level and always
//! propagated.

mod board_run;
pub mod cancel;
pub mod error;
pub mod safety;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::board::{BoardStatus, ProbeStatus, ProgramStatus};
use crate::config::Config;
use crate::controllers::{HeadControl, MotionControl, Programmer, TargetControl};
use crate::events::{ErrorInfo, EventBus, ProgBotObserver};
use crate::obs::{emit_cleanup_error, emit_cycle_finished, emit_cycle_started, CycleSpan};
use crate::stats::CycleStats;
use crate::summary::{CycleResultHandler, CycleSummary};
use crate::vision::VisionController;

pub use cancel::CancelSignal;
pub use error::{ProgBotError, ProgBotResult};
pub use safety::{HeadState, POWER_SETTLE, SAFE_Z};

/// Passive UART monitor window after a successful program.
pub const MONITOR_WINDOW: Duration = Duration::from_secs(5);

/// The collaborators a [`ProgBot`] drives.
#[derive(Clone)]
pub struct Hardware {
    pub motion: Arc<dyn MotionControl>,
    pub head: Arc<dyn HeadControl>,
    pub target: Arc<dyn TargetControl>,
    pub programmer: Arc<dyn Programmer>,
    /// `None` disables the QR pass regardless of the panel setting.
    pub vision: Option<Arc<VisionController>>,
}

/// Where a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStart {
    /// Home, scan, then every board.
    Full,
    /// Continue the sweep from this position.
    From(u32, u32),
}

pub struct ProgBot {
    config: Config,
    hw: Hardware,
    events: EventBus,
    handlers: Vec<Arc<dyn CycleResultHandler>>,
    statuses: BTreeMap<(u32, u32), BoardStatus>,
    stats: CycleStats,
    cancel: CancelSignal,
    connected: bool,
    current_board: Option<(u32, u32)>,
    last_summary: Option<CycleSummary>,
}

impl ProgBot {
    pub fn new(config: Config, hardware: Hardware) -> Self {
        let mut bot = Self {
            config,
            hw: hardware,
            events: EventBus::new(),
            handlers: Vec::new(),
            statuses: BTreeMap::new(),
            stats: CycleStats::new(),
            cancel: CancelSignal::new(),
            connected: false,
            current_board: None,
            last_summary: None,
        };
        bot.init_panel();
        bot
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register an observer. It receives the current panel immediately.
    pub fn subscribe(&mut self, observer: Arc<dyn ProgBotObserver>) {
        self.events.subscribe(observer);
        self.publish_panel();
    }

    pub fn add_result_handler(&mut self, handler: Arc<dyn CycleResultHandler>) {
        self.handlers.push(handler);
    }

    /// Handle for cancelling a running cycle from another task.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Rebuild the board records for the configured panel.
    pub fn init_panel(&mut self) {
        self.statuses.clear();
        for col in 0..self.config.board_num_cols {
            for row in 0..self.config.board_num_rows {
                let mut status = BoardStatus::new(col, row);
                status.enabled = !self.config.is_skipped(col, row);
                self.statuses.insert((col, row), status);
            }
        }
        self.publish_panel();
    }

    fn publish_panel(&self) {
        self.events
            .panel_changed(self.config.board_num_cols, self.config.board_num_rows);
        for status in self.statuses.values() {
            self.events
                .board_status_changed(self.config.cell_id(status.col, status.row), status);
        }
    }

    pub fn board_status(&self, col: u32, row: u32) -> Option<&BoardStatus> {
        self.statuses.get(&(col, row))
    }

    /// Every board, column-major.
    pub fn board_statuses(&self) -> impl Iterator<Item = &BoardStatus> {
        self.statuses.values()
    }

    fn check_position(&self, col: u32, row: u32) -> ProgBotResult<()> {
        if self.config.contains(col, row) {
            return Ok(());
        }
        Err(ProgBotError::OutOfPanel {
            col,
            row,
            cols: self.config.board_num_cols,
            rows: self.config.board_num_rows,
        })
    }

    /// Replace the skip list and update which boards are enabled.
    pub fn set_skip_board_pos(&mut self, positions: Vec<(u32, u32)>) -> ProgBotResult<()> {
        for &(col, row) in &positions {
            self.check_position(col, row)?;
        }
        info!(skipped = positions.len(), "skip list updated");
        self.config.skip_board_pos = positions;
        let keys: Vec<_> = self.statuses.keys().copied().collect();
        for (col, row) in keys {
            let enabled = !self.config.is_skipped(col, row);
            self.update_board(col, row, |s| s.enabled = enabled);
        }
        Ok(())
    }

    /// Forget everything recorded for one board.
    pub fn clear_status(&mut self, col: u32, row: u32) -> ProgBotResult<()> {
        self.check_position(col, row)?;
        self.update_board(col, row, BoardStatus::reset);
        Ok(())
    }

    /// Forget everything recorded for every board.
    pub fn reset_all(&mut self) {
        for status in self.statuses.values_mut() {
            status.reset();
        }
        self.publish_panel();
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn last_summary(&self) -> Option<&CycleSummary> {
        self.last_summary.as_ref()
    }

    /// Board being processed, if any.
    pub fn current_board(&self) -> Option<(u32, u32)> {
        self.current_board
    }

    /// Run every board of the panel.
    pub async fn full_cycle(&mut self) -> ProgBotResult<CycleSummary> {
        self.reset_all();
        self.run(RunStart::Full).await
    }

    /// Re-run one board from scratch, then continue the sweep after it.
    pub async fn retry_board(&mut self, col: u32, row: u32) -> ProgBotResult<CycleSummary> {
        self.clear_status(col, row)?;
        self.events.phase_changed(format!("Retry board [{col}, {row}]"));
        self.run(RunStart::From(col, row)).await
    }

    /// Give up on one board and continue the sweep after it.
    pub async fn skip_board(&mut self, col: u32, row: u32) -> ProgBotResult<CycleSummary> {
        self.check_position(col, row)?;
        self.update_board(col, row, |s| {
            let info = s.board_info.take();
            s.reset();
            s.board_info = info;
            s.set_probe(ProbeStatus::Skipped);
            s.set_program(ProgramStatus::Skipped);
            s.info_mut().notes = "Skipped by operator".into();
        });
        match self.next_position(col, row) {
            Some((next_col, next_row)) => self.run(RunStart::From(next_col, next_row)).await,
            None => self.run_positions(Vec::new(), false).await,
        }
    }

    /// The position after `(col, row)` in sweep order.
    fn next_position(&self, col: u32, row: u32) -> Option<(u32, u32)> {
        let (col, row) = if row + 1 >= self.config.board_num_rows {
            (col + 1, 0)
        } else {
            (col, row + 1)
        };
        self.config.contains(col, row).then_some((col, row))
    }

    /// Positions from `(col, row)` to the end of the panel, column-major.
    fn sweep_from(&self, start_col: u32, start_row: u32) -> Vec<(u32, u32)> {
        let mut positions = Vec::new();
        for col in start_col..self.config.board_num_cols {
            let first_row = if col == start_col { start_row } else { 0 };
            for row in first_row..self.config.board_num_rows {
                positions.push((col, row));
            }
        }
        positions
    }

    async fn run(&mut self, start: RunStart) -> ProgBotResult<CycleSummary> {
        let (positions, scan) = match start {
            RunStart::Full => (self.sweep_from(0, 0), true),
            RunStart::From(col, row) => {
                self.check_position(col, row)?;
                let positions = self.sweep_from(col, row);
                for &(col, row) in &positions {
                    self.update_board(col, row, BoardStatus::reset_for_rerun);
                }
                (positions, false)
            }
        };
        self.run_positions(positions, scan).await
    }

    async fn run_positions(
        &mut self,
        positions: Vec<(u32, u32)>,
        scan: bool,
    ) -> ProgBotResult<CycleSummary> {
        let cycle_id = Uuid::new_v4().to_string();
        let span = CycleSpan::new(&cycle_id);
        span.instrument(self.run_cycle(&cycle_id, positions, scan))
            .await
    }

    async fn run_cycle(
        &mut self,
        cycle_id: &str,
        positions: Vec<(u32, u32)>,
        scan: bool,
    ) -> ProgBotResult<CycleSummary> {
        self.cancel.reset();
        self.stats.start(positions.len() as u32);
        emit_cycle_started(cycle_id, &self.config.panel_name, positions.len() as u32);

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProgBotError::Cancelled),
            result = self.cycle_body(&positions, scan) => result,
        };

        match &result {
            Ok(()) => {}
            Err(ProgBotError::Cancelled) => self.cleanup_cancelled().await,
            Err(e) => self.cleanup_failed(e).await,
        }
        self.current_board = None;
        self.stats.finish();
        self.events.stats_updated(self.stats.summary_text());

        let summary = self.build_summary();
        emit_cycle_finished(
            cycle_id,
            self.stats.elapsed().as_millis() as u64,
            summary.passed_count,
            summary.failed_count,
            summary.skipped_count,
            result.is_ok(),
        );
        self.last_summary = Some(summary.clone());

        result?;
        for handler in &self.handlers {
            if let Err(e) = handler.on_cycle_complete(&summary).await {
                warn!(error = %e, "cycle result handler failed");
            }
        }
        Ok(summary)
    }

    async fn cycle_body(&mut self, positions: &[(u32, u32)], scan: bool) -> ProgBotResult<()> {
        self.ensure_connected().await?;
        self.events.phase_changed("Initializing devices");
        self.hw.motion.init(true).await?;

        if scan && self.config.vision_enabled {
            if let Some(vision) = self.hw.vision.clone() {
                self.scan_all_boards(&vision).await?;
            }
        }

        for &(col, row) in positions {
            self.run_board(col, row).await?;
        }

        self.events.phase_changed("Done with full cycle");
        self.hw
            .motion
            .rapid_xy_abs(self.config.park_x, self.config.park_y)
            .await?;
        self.hw.motion.motors_off().await?;
        Ok(())
    }

    /// Devices are opened once per process; controllers reconnect a dead
    /// link on their own afterwards.
    async fn ensure_connected(&mut self) -> ProgBotResult<()> {
        if self.connected {
            return Ok(());
        }
        self.events.phase_changed("Opening devices");
        self.hw.motion.connect().await?;
        self.hw.head.connect().await?;
        self.hw.target.connect().await?;
        self.connected = true;
        Ok(())
    }

    /// Close every device. The next cycle reopens them.
    pub async fn disconnect(&mut self) {
        self.hw.motion.disconnect().await;
        self.hw.head.disconnect().await;
        self.hw.target.disconnect().await;
        self.connected = false;
    }

    fn interrupt_current(&mut self) {
        if let Some((col, row)) = self.current_board {
            self.update_board(col, row, BoardStatus::interrupt);
        }
    }

    /// The board future was dropped mid-flight: retract, park, de-energize.
    async fn cleanup_cancelled(&mut self) {
        warn!(board = ?self.current_board, "cycle cancelled, cleaning up");
        self.interrupt_current();
        self.events.phase_changed("Cancelling");

        let motion = Arc::clone(&self.hw.motion);
        if let Err(e) = self.hw.head.set_all(false).await {
            emit_cleanup_error("head_power_off", &e);
        }
        if let Err(e) = motion.rapid_z_abs(SAFE_Z).await {
            emit_cleanup_error("retract", &e);
        }
        if let Err(e) = motion
            .rapid_xy_abs(self.config.park_x, self.config.park_y)
            .await
        {
            emit_cleanup_error("park", &e);
        }
        if let Err(e) = motion.motors_off().await {
            emit_cleanup_error("motors_off", &e);
        }
        if let Some(vision) = &self.hw.vision {
            vision.stop_preview().await;
        }
        self.events.phase_changed("Cancelled");
    }

    /// Report the failure with the board it happened on, then de-energize.
    async fn cleanup_failed(&mut self, error: &ProgBotError) {
        tracing::error!(board = ?self.current_board, error = %error, "cycle failed");
        self.events
            .error_occurred(ErrorInfo::from_error(error, self.current_board));
        self.interrupt_current();
        if let Err(e) = self.hw.motion.motors_off().await {
            emit_cleanup_error("motors_off", &e);
        }
        if let Some(vision) = &self.hw.vision {
            vision.stop_preview().await;
        }
    }

    fn build_summary(&self) -> CycleSummary {
        let disabled = self.statuses.values().filter(|s| !s.enabled).count();
        CycleSummary::build(
            &self.config.panel_name,
            self.statuses.values(),
            &self.stats,
            self.config.board_num_rows,
            disabled,
        )
    }

    /// Apply `f` to a board record and publish the result.
    fn update_board<R>(
        &mut self,
        col: u32,
        row: u32,
        f: impl FnOnce(&mut BoardStatus) -> R,
    ) -> R {
        let status = self
            .statuses
            .entry((col, row))
            .or_insert_with(|| BoardStatus::new(col, row));
        let out = f(status);
        self.events
            .board_status_changed(self.config.cell_id(col, row), status);
        out
    }
}
