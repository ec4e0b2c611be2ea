//! The per-board sequence and the QR pass.
//!
//! ```text
//! skip check -> probe -> safe height (no contact) -> descend -> contact
//!   -> power/logic on -> identify | program [+ monitor] | test-only
//!   -> provision -> test -> power off -> retract
//! ```
//!
//! No step moves backwards. Whatever happens after the first move, the head
//! is powered down and retracted before [`ProgBot::run_board`] returns.

use std::sync::Arc;

use chrono::Local;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::safety::{self, AbortOnDrop, HeadState, POWER_SETTLE};
use super::{ProgBot, ProgBotError, ProgBotResult, MONITOR_WINDOW};
use crate::board::{
    BoardInfo, ProbeStatus, ProgramStatus, ProvisionStatus, TestStatus, VisionStatus,
};
use crate::config::OperationMode;
use crate::obs::{emit_board_finished, emit_cleanup_error};
use crate::provisioning::{VariableContext, Variables};
use crate::summary::BoardResult;
use crate::vision::VisionController;

impl ProgBot {
    /// Run one board through the whole sequence.
    ///
    /// Boards on the skip list, or whose QR scan failed, are marked skipped
    /// without touching the hardware. Mechanical faults fail the board and
    /// are returned after the head is safe.
    pub async fn run_board(&mut self, col: u32, row: u32) -> ProgBotResult<()> {
        self.check_position(col, row)?;
        self.current_board = Some((col, row));
        let started = Instant::now();

        let vision_failed = self
            .board_status(col, row)
            .is_some_and(|s| s.vision() == VisionStatus::Failed);
        if self.config.is_skipped(col, row) || vision_failed {
            info!(col, row, "skipping board");
            self.skip_board_phases(col, row);
            self.finish_board(col, row, started).await;
            self.current_board = None;
            return Ok(());
        }

        let mut head = HeadState::default();
        let result = self.board_sequence(col, row, &mut head).await;

        self.events.phase_changed("Move to safe height");
        let cleanup =
            safety::make_safe(self.hw.motion.as_ref(), self.hw.head.as_ref(), &mut head).await;

        let result = match (result, cleanup) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), cleanup) => {
                if let Err(c) = cleanup {
                    emit_cleanup_error("board_exit", &c);
                }
                Err(e)
            }
        };
        if let Err(e) = &result {
            if !e.is_mechanical() {
                self.update_board(col, row, |s| {
                    s.interrupt();
                    s.fail(e.to_string());
                });
            }
        }

        self.finish_board(col, row, started).await;
        if result.is_ok() {
            self.current_board = None;
        }
        result
    }

    fn skip_board_phases(&mut self, col: u32, row: u32) {
        self.update_board(col, row, |s| {
            s.set_probe(ProbeStatus::Skipped);
            s.set_program(ProgramStatus::Skipped);
        });
    }

    async fn board_sequence(
        &mut self,
        col: u32,
        row: u32,
        head: &mut HeadState,
    ) -> ProgBotResult<()> {
        let probe_started = Instant::now();
        self.update_board(col, row, |s| s.set_probe(ProbeStatus::Probing));

        let (x, y) = self.config.board_position(col, row);
        self.events.phase_changed(format!("Move to board [{col}, {row}]"));
        self.hw.motion.rapid_xy_abs(x, y).await?;

        self.events.phase_changed("Probe height");
        head.lowered = true;
        let dist_to_probe = match self.hw.motion.do_probe().await {
            Ok(distance) => distance,
            Err(source) => {
                warn!(col, row, error = %source, "probe failed");
                self.update_board(col, row, |s| {
                    s.set_probe(ProbeStatus::Failed);
                    s.fail("Probe failed");
                    s.info_mut().probe_result = Some(false);
                });
                return Err(ProgBotError::ProbeFailed { col, row, source });
            }
        };
        let dist_to_board = dist_to_probe + self.config.probe_plane_to_board;
        debug!(col, row, dist_to_probe, dist_to_board, "probed");

        self.events.phase_changed("Move to safe height");
        self.hw.motion.rapid_z_abs(-dist_to_probe).await?;

        self.events.phase_changed("Check no contact");
        if self.hw.head.check_contact().await? {
            warn!(col, row, "contact at safe height");
            self.update_board(col, row, |s| {
                s.set_probe(ProbeStatus::Failed);
                s.fail("Unexpected contact");
                s.info_mut().probe_result = Some(false);
            });
            return Err(ProgBotError::UnexpectedContact { col, row });
        }

        self.events.phase_changed("Move to board height");
        self.hw
            .motion
            .move_z_abs(-dist_to_board, self.config.descend_feed_rate)
            .await?;

        self.events.phase_changed("Check for contact");
        self.establish_contact(col, row).await?;
        self.update_board(col, row, |s| {
            s.set_probe(ProbeStatus::Completed);
            let info = s.info_mut();
            info.probe_result = Some(true);
            info.timestamp_probe = Some(Local::now());
        });
        self.stats
            .record_phase(col, row, "probe", probe_started.elapsed());

        self.events.phase_changed("Enable head power");
        self.hw.head.set_power(true).await?;
        head.powered = true;
        tokio::time::sleep(POWER_SETTLE).await;
        self.events.phase_changed("Enable head logic");
        self.hw.head.set_logic(true).await?;
        tokio::time::sleep(POWER_SETTLE).await;

        let programs = self.config.operation_mode != OperationMode::TestOnly;
        if !programs || !self.config.programming_enabled {
            debug!(col, row, "programming skipped");
            self.update_board(col, row, |s| s.set_program(ProgramStatus::Skipped));
            if self.config.operation_mode != OperationMode::IdentifyOnly {
                self.provision_and_test(col, row).await?;
            }
            return Ok(());
        }

        match self.config.operation_mode {
            OperationMode::IdentifyOnly => {
                self.identify_board(col, row).await?;
            }
            _ => {
                if self.program_board(col, row).await? {
                    self.monitor_target().await;
                    self.provision_and_test(col, row).await?;
                }
            }
        }
        Ok(())
    }

    /// Provisioning, then the target test when the mode and panel ask for
    /// one. A failed provisioning run leaves the test skipped.
    async fn provision_and_test(&mut self, col: u32, row: u32) -> ProgBotResult<()> {
        let provisioned = self.provision_board(col, row).await?;
        if !self.config.operation_mode.runs_test() {
            return Ok(());
        }
        if !self.config.test_enabled || !provisioned {
            debug!(col, row, provisioned, "target test skipped");
            self.update_board(col, row, |s| s.set_test(TestStatus::Skipped));
            return Ok(());
        }
        self.test_board(col, row).await?;
        Ok(())
    }

    /// Require contact after the descent, nudging Y through the configured
    /// offsets if it is missing.
    ///
    /// Each offset is absolute from the nominal position, so the net jog
    /// always equals the offset that made contact. When none does, the
    /// stage is moved back to nominal before failing.
    async fn establish_contact(&mut self, col: u32, row: u32) -> ProgBotResult<()> {
        if self.hw.head.check_contact().await? {
            return Ok(());
        }

        let offsets = self.config.contact_offsets();
        let mut applied = 0.0;
        for (attempt, &offset) in offsets.iter().enumerate() {
            self.events
                .phase_changed(format!("Adjust Y {offset:+.2} mm, check contact"));
            self.hw.motion.rapid_xy_rel(0.0, offset - applied).await?;
            applied = offset;
            if self.hw.head.check_contact().await? {
                info!(col, row, attempt = attempt + 1, offset, "contact after Y adjustment");
                return Ok(());
            }
        }

        if applied != 0.0 {
            self.hw.motion.rapid_xy_rel(0.0, -applied).await?;
        }
        warn!(col, row, attempts = offsets.len(), "no contact");
        self.update_board(col, row, |s| {
            s.set_probe(ProbeStatus::Failed);
            s.fail("No contact");
            s.info_mut().probe_result = Some(false);
        });
        Err(ProgBotError::NoContact {
            col,
            row,
            attempts: offsets.len(),
        })
    }

    async fn identify_board(&mut self, col: u32, row: u32) -> ProgBotResult<bool> {
        let started = Instant::now();
        self.update_board(col, row, |s| s.set_program(ProgramStatus::Identifying));
        self.events.phase_changed("Identifying device");

        let result = self.hw.programmer.identify(&self.events).await;
        self.stats.record_phase(col, row, "identify", started.elapsed());
        let identified = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.update_board(col, row, |s| {
                    s.set_program(ProgramStatus::Failed);
                    s.fail("Identify error");
                });
                return Err(e.into());
            }
        };
        info!(col, row, identified, "identify finished");
        self.update_board(col, row, |s| {
            if identified {
                s.set_program(ProgramStatus::Identified);
            } else {
                s.set_program(ProgramStatus::Failed);
                s.fail("Identify failed");
            }
        });
        Ok(identified)
    }

    async fn program_board(&mut self, col: u32, row: u32) -> ProgBotResult<bool> {
        let started = Instant::now();
        self.update_board(col, row, |s| s.set_program(ProgramStatus::Programming));
        self.events.phase_changed("Programming device");

        let result = self.hw.programmer.program(&self.events).await;
        self.stats.record_phase(col, row, "program", started.elapsed());
        let programmed = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.update_board(col, row, |s| {
                    s.set_program(ProgramStatus::Failed);
                    s.fail("Program error");
                    s.info_mut().program_result = Some(false);
                });
                return Err(e.into());
            }
        };
        info!(col, row, programmed, "program finished");
        self.update_board(col, row, |s| {
            let info = s.info_mut();
            info.program_result = Some(programmed);
            info.timestamp_program = Some(Local::now());
            if programmed {
                s.set_program(ProgramStatus::Completed);
            } else {
                s.set_program(ProgramStatus::Failed);
                s.fail("Program failed");
            }
        });
        Ok(programmed)
    }

    /// Log the target's UART for [`MONITOR_WINDOW`]. Observational only.
    async fn monitor_target(&mut self) {
        self.events.phase_changed("Monitoring target output");
        let target = Arc::clone(&self.hw.target);
        let task = AbortOnDrop(tokio::spawn(async move { target.monitor().await }));
        tokio::time::sleep(MONITOR_WINDOW).await;
        if task.is_finished() {
            safety::report_early_exit("target_monitor");
        }
    }

    /// Run the panel's provisioning script, if enabled. Returns false only
    /// when the script ran and failed.
    async fn provision_board(&mut self, col: u32, row: u32) -> ProgBotResult<bool> {
        let Some(script) = self
            .config
            .provision_script
            .clone()
            .filter(|_| self.config.provision_enabled)
        else {
            return Ok(true);
        };

        let started = Instant::now();
        self.update_board(col, row, |s| s.set_provision(ProvisionStatus::Provisioning));
        self.events
            .phase_changed(format!("Provisioning ({})", script.name));

        let mut vision = Variables::new();
        if let Some(serial) = self
            .board_status(col, row)
            .and_then(|s| s.board_info.as_ref())
            .and_then(|i| i.serial_number.clone())
        {
            vision.insert("qr_raw".into(), serial.clone());
            vision.insert("serial_number".into(), serial);
        }
        let mut context = VariableContext::new(
            row,
            col,
            &self.config.panel_name,
            vision,
            self.config.custom_variables.clone(),
        );

        let result = self.hw.target.provision(&script, &mut context).await;
        self.stats.record_phase(col, row, "provision", started.elapsed());
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                self.update_board(col, row, |s| {
                    s.set_provision(ProvisionStatus::Failed);
                    s.fail("Provisioning error");
                    s.info_mut().provision_result = Some(false);
                });
                return Err(e.into());
            }
        };
        let reason = match result.failed_step() {
            Some(step) => format!(
                "Step {}: {}",
                step.step_index + 1,
                step.error.as_deref().unwrap_or("failed")
            ),
            None => result
                .error
                .clone()
                .unwrap_or_else(|| "Provisioning failed".into()),
        };
        self.update_board(col, row, |s| {
            let info = s.info_mut();
            info.test_data
                .extend(result.captures.iter().map(|(k, v)| (k.clone(), v.clone())));
            info.provision_result = Some(result.success);
            info.timestamp_provision = Some(Local::now());
            if result.success {
                s.set_provision(ProvisionStatus::Completed);
            } else {
                s.set_provision(ProvisionStatus::Failed);
                s.fail(reason);
            }
        });
        Ok(result.success)
    }

    async fn test_board(&mut self, col: u32, row: u32) -> ProgBotResult<bool> {
        let started = Instant::now();
        self.update_board(col, row, |s| s.set_test(TestStatus::Testing));
        self.events.phase_changed("Testing target");

        let result = self.hw.target.test().await;
        self.stats.record_phase(col, row, "test", started.elapsed());
        let passed = match result {
            Ok(passed) => passed,
            Err(e) => {
                self.update_board(col, row, |s| {
                    s.set_test(TestStatus::Failed);
                    s.fail("Test error");
                });
                return Err(e.into());
            }
        };
        info!(col, row, passed, "target test finished");
        self.update_board(col, row, |s| {
            if passed {
                s.set_test(TestStatus::Completed);
            } else {
                s.set_test(TestStatus::Failed);
                s.fail("Target test failed");
            }
        });
        Ok(passed)
    }

    /// Record the board's outcome and hand it to the result handlers.
    async fn finish_board(&mut self, col: u32, row: u32, started: Instant) {
        let Some(status) = self.statuses.get(&(col, row)) else {
            return;
        };
        if let Some((outcome, _)) = status.outcome() {
            self.stats.record_outcome(outcome);
            emit_board_finished(
                col,
                row,
                &outcome.to_string(),
                started.elapsed().as_millis() as u64,
            );
        }

        let result = BoardResult::from_status(
            status,
            self.config.board_num_rows,
            self.stats.board_times(col, row),
        );
        self.events.stats_updated(self.stats.summary_text());
        if let Some(result) = result {
            for handler in &self.handlers {
                if let Err(e) = handler.on_board_complete(&result).await {
                    warn!(col, row, error = %e, "board result handler failed");
                }
            }
        }
    }

    /// Scan every board that is not on the skip list. Boards without a
    /// readable code fail vision and will be skipped by the board sequence.
    pub(super) async fn scan_all_boards(&mut self, vision: &VisionController) -> ProgBotResult<()> {
        self.events.qr_scan_started();
        self.events.phase_changed("Scanning QR codes");
        let result = self.scan_positions(vision).await;
        vision.stop_preview().await;
        self.events.qr_scan_ended();
        result
    }

    async fn scan_positions(&mut self, vision: &VisionController) -> ProgBotResult<()> {
        let positions = self.sweep_from(0, 0);
        for (col, row) in positions {
            if self.config.is_skipped(col, row) {
                continue;
            }
            self.current_board = Some((col, row));
            let started = Instant::now();
            self.update_board(col, row, |s| s.set_vision(VisionStatus::InProgress));

            let (x, y) = self.config.camera_position(col, row);
            self.events
                .phase_changed(format!("Scan QR at [{col}, {row}]"));
            self.hw.motion.rapid_xy_abs(x, y).await?;
            let scan = vision.scan(self.hw.motion.as_ref(), Some((x, y))).await;
            self.stats.record_phase(col, row, "vision", started.elapsed());

            self.update_board(col, row, |s| match scan {
                Some(scan) => {
                    info!(col, row, serial = %scan.data, tier = ?scan.tier, "board identified");
                    s.set_vision(VisionStatus::Passed);
                    let mut info = BoardInfo::new(Some(scan.data), (col, row));
                    info.timestamp_qr_scan = Some(Local::now());
                    s.board_info = Some(info);
                }
                None => {
                    warn!(col, row, "no QR code found");
                    s.set_vision(VisionStatus::Failed);
                    s.fail("No QR code");
                }
            });
        }
        self.current_board = None;
        Ok(())
    }
}
