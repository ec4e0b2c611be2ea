//! Per-position board state: phase statuses, failure reason and collected
//! data.
//!
//! Within one cycle a phase that reached a terminal status (completed,
//! failed, skipped) keeps it. Only [`BoardStatus::reset`] (clear status or
//! retry) returns phases to idle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// RGBA with channels in 0..=1.
pub type Rgba = [f32; 4];

/// Behaviour shared by every per-phase status enum.
pub trait PhaseState: Copy + PartialEq + fmt::Debug + fmt::Display {
    /// Phase name used in logs.
    const PHASE: &'static str;

    /// Whether the phase is finished for this cycle.
    fn is_terminal(self) -> bool;

    fn is_failed(self) -> bool;

    fn is_running(self) -> bool;
}

/// QR scan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisionStatus {
    #[default]
    Idle,
    InProgress,
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for VisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Pending",
            Self::InProgress => "Scanning",
            Self::Passed => "QR OK",
            Self::Failed => "QR Failed",
            Self::Skipped => "Skipped",
        })
    }
}

impl PhaseState for VisionStatus {
    const PHASE: &'static str = "vision";

    fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped)
    }

    fn is_failed(self) -> bool {
        self == Self::Failed
    }

    fn is_running(self) -> bool {
        self == Self::InProgress
    }
}

/// Probe and contact status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    #[default]
    Idle,
    Probing,
    Completed,
    Failed,
    Skipped,
    Interrupted,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Pending",
            Self::Probing => "Probing",
            Self::Completed => "Contact OK",
            Self::Failed => "Contact Failed",
            Self::Skipped => "Skipped",
            Self::Interrupted => "Interrupted",
        })
    }
}

impl PhaseState for ProbeStatus {
    const PHASE: &'static str = "probe";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Interrupted
        )
    }

    fn is_failed(self) -> bool {
        self == Self::Failed
    }

    fn is_running(self) -> bool {
        self == Self::Probing
    }
}

/// Programming or identification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramStatus {
    #[default]
    Idle,
    Identifying,
    Identified,
    Programming,
    Completed,
    Failed,
    Skipped,
    Interrupted,
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Pending",
            Self::Identifying => "Identifying",
            Self::Identified => "Identified",
            Self::Programming => "Programming",
            Self::Completed => "Programmed",
            Self::Failed => "Program Failed",
            Self::Skipped => "Skipped",
            Self::Interrupted => "Interrupted",
        })
    }
}

impl PhaseState for ProgramStatus {
    const PHASE: &'static str = "program";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Identified | Self::Completed | Self::Failed | Self::Skipped | Self::Interrupted
        )
    }

    fn is_failed(self) -> bool {
        self == Self::Failed
    }

    fn is_running(self) -> bool {
        matches!(self, Self::Identifying | Self::Programming)
    }
}

/// Provisioning script status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionStatus {
    #[default]
    Idle,
    Provisioning,
    Completed,
    Failed,
    Skipped,
    Interrupted,
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Pending",
            Self::Provisioning => "Provisioning",
            Self::Completed => "Provisioned",
            Self::Failed => "Provision Failed",
            Self::Skipped => "Skipped",
            Self::Interrupted => "Interrupted",
        })
    }
}

impl PhaseState for ProvisionStatus {
    const PHASE: &'static str = "provision";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Interrupted
        )
    }

    fn is_failed(self) -> bool {
        self == Self::Failed
    }

    fn is_running(self) -> bool {
        self == Self::Provisioning
    }
}

/// Functional test status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    #[default]
    Idle,
    Testing,
    Completed,
    Failed,
    Skipped,
    Interrupted,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Pending",
            Self::Testing => "Testing",
            Self::Completed => "Tested",
            Self::Failed => "Test Failed",
            Self::Skipped => "Skipped",
            Self::Interrupted => "Interrupted",
        })
    }
}

impl PhaseState for TestStatus {
    const PHASE: &'static str = "test";

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Interrupted
        )
    }

    fn is_failed(self) -> bool {
        self == Self::Failed
    }

    fn is_running(self) -> bool {
        self == Self::Testing
    }
}

/// Data collected about one physical board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardInfo {
    /// Decoded QR text.
    pub serial_number: Option<String>,

    /// `(col, row)` on the panel.
    pub position: Option<(u32, u32)>,

    /// Values captured by provisioning steps.
    pub test_data: BTreeMap<String, String>,

    pub timestamp_qr_scan: Option<DateTime<Local>>,
    pub timestamp_probe: Option<DateTime<Local>>,
    pub timestamp_program: Option<DateTime<Local>>,
    pub timestamp_provision: Option<DateTime<Local>>,

    pub probe_result: Option<bool>,
    pub program_result: Option<bool>,
    pub provision_result: Option<bool>,

    pub notes: String,
}

impl BoardInfo {
    pub fn new(serial_number: Option<String>, position: (u32, u32)) -> Self {
        Self {
            serial_number,
            position: Some(position),
            ..Self::default()
        }
    }

    /// Flat key/value record for exports. Captured values become their own
    /// columns.
    pub fn to_record(&self) -> BTreeMap<String, String> {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        let mut record = BTreeMap::new();
        record.insert("serial_number".into(), opt(&self.serial_number));
        record.insert("position_col".into(), opt(&self.position.map(|p| p.0)));
        record.insert("position_row".into(), opt(&self.position.map(|p| p.1)));
        record.insert("timestamp_qr_scan".into(), opt(&self.timestamp_qr_scan.map(|t| t.to_rfc3339())));
        record.insert("timestamp_probe".into(), opt(&self.timestamp_probe.map(|t| t.to_rfc3339())));
        record.insert("timestamp_program".into(), opt(&self.timestamp_program.map(|t| t.to_rfc3339())));
        record.insert(
            "timestamp_provision".into(),
            opt(&self.timestamp_provision.map(|t| t.to_rfc3339())),
        );
        record.insert("probe_result".into(), opt(&self.probe_result));
        record.insert("program_result".into(), opt(&self.program_result));
        record.insert("provision_result".into(), opt(&self.provision_result));
        record.insert("notes".into(), self.notes.clone());
        for (k, v) in &self.test_data {
            record.entry(k.clone()).or_insert_with(|| v.clone());
        }
        record
    }
}

/// Final classification of a board after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        })
    }
}

const COLOR_DISABLED: Rgba = [0.0, 0.0, 0.0, 1.0];
const COLOR_INTERRUPTED: Rgba = [1.0, 0.5, 0.0, 1.0];
const COLOR_TESTED: Rgba = [0.0, 0.8, 0.0, 1.0];
const COLOR_PROVISIONED: Rgba = [0.0, 0.6, 0.0, 1.0];
const COLOR_PROGRAMMED: Rgba = [0.0, 0.5, 0.0, 1.0];
const COLOR_IDENTIFIED: Rgba = [1.0, 0.0, 1.0, 1.0];
const COLOR_VISION_PASSED: Rgba = [0.0, 0.7, 0.7, 1.0];
const COLOR_FAILED: Rgba = [1.0, 0.0, 0.0, 1.0];
const COLOR_VISION_FAILED: Rgba = [0.5, 0.0, 0.0, 1.0];
const COLOR_TESTING: Rgba = [0.0, 1.0, 1.0, 1.0];
const COLOR_PROVISIONING: Rgba = [0.5, 1.0, 0.5, 1.0];
const COLOR_PROGRAMMING: Rgba = [1.0, 1.0, 0.0, 1.0];
const COLOR_SCANNING: Rgba = [0.5, 0.5, 1.0, 1.0];
const COLOR_PENDING: Rgba = [0.5, 0.5, 0.5, 1.0];

/// State of one panel position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub col: u32,
    pub row: u32,
    pub enabled: bool,
    vision: VisionStatus,
    probe: ProbeStatus,
    program: ProgramStatus,
    provision: ProvisionStatus,
    test: TestStatus,
    pub failure_reason: Option<String>,
    pub board_info: Option<BoardInfo>,
}

/// Apply `next` unless `current` is already terminal. Returns whether the
/// status changed.
fn transition<S: PhaseState>(current: &mut S, next: S, col: u32, row: u32) -> bool {
    if *current == next {
        return false;
    }
    if current.is_terminal() {
        warn!(
            col,
            row,
            phase = S::PHASE,
            current = ?*current,
            requested = ?next,
            "ignoring transition out of terminal status"
        );
        return false;
    }
    *current = next;
    true
}

impl BoardStatus {
    pub fn new(col: u32, row: u32) -> Self {
        Self {
            col,
            row,
            enabled: true,
            vision: VisionStatus::Idle,
            probe: ProbeStatus::Idle,
            program: ProgramStatus::Idle,
            provision: ProvisionStatus::Idle,
            test: TestStatus::Idle,
            failure_reason: None,
            board_info: None,
        }
    }

    pub fn position(&self) -> (u32, u32) {
        (self.col, self.row)
    }

    pub fn vision(&self) -> VisionStatus {
        self.vision
    }

    pub fn probe(&self) -> ProbeStatus {
        self.probe
    }

    pub fn program(&self) -> ProgramStatus {
        self.program
    }

    pub fn provision(&self) -> ProvisionStatus {
        self.provision
    }

    pub fn test(&self) -> TestStatus {
        self.test
    }

    pub fn set_vision(&mut self, status: VisionStatus) -> bool {
        transition(&mut self.vision, status, self.col, self.row)
    }

    pub fn set_probe(&mut self, status: ProbeStatus) -> bool {
        transition(&mut self.probe, status, self.col, self.row)
    }

    pub fn set_program(&mut self, status: ProgramStatus) -> bool {
        transition(&mut self.program, status, self.col, self.row)
    }

    pub fn set_provision(&mut self, status: ProvisionStatus) -> bool {
        transition(&mut self.provision, status, self.col, self.row)
    }

    pub fn set_test(&mut self, status: TestStatus) -> bool {
        transition(&mut self.test, status, self.col, self.row)
    }

    /// Record why the board failed. The first reason sticks.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.into());
        }
    }

    /// The board's info record, created on first use.
    pub fn info_mut(&mut self) -> &mut BoardInfo {
        let position = self.position();
        self.board_info
            .get_or_insert_with(|| BoardInfo::new(None, position))
    }

    /// Mark every phase that is still running as interrupted.
    pub fn interrupt(&mut self) {
        if self.vision.is_running() {
            self.vision = VisionStatus::Idle;
        }
        if self.probe.is_running() {
            self.probe = ProbeStatus::Interrupted;
        }
        if self.program.is_running() {
            self.program = ProgramStatus::Interrupted;
        }
        if self.provision.is_running() {
            self.provision = ProvisionStatus::Interrupted;
        }
        if self.test.is_running() {
            self.test = TestStatus::Interrupted;
        }
    }

    /// Back to idle. `enabled` is kept.
    pub fn reset(&mut self) {
        *self = Self {
            enabled: self.enabled,
            ..Self::new(self.col, self.row)
        };
    }

    /// Back to idle for a continued sweep. The QR result survives because a
    /// continuation does not scan again.
    pub fn reset_for_rerun(&mut self) {
        let vision = self.vision;
        let scan = self.board_info.as_ref().map(|info| BoardInfo {
            timestamp_qr_scan: info.timestamp_qr_scan,
            ..BoardInfo::new(info.serial_number.clone(), self.position())
        });
        let reason = self.failure_reason.take();

        self.reset();
        self.vision = vision;
        match vision {
            VisionStatus::Passed => self.board_info = scan,
            VisionStatus::Failed => self.failure_reason = reason,
            _ => {}
        }
    }

    /// Whether any phase ever left idle.
    pub fn is_touched(&self) -> bool {
        self.vision != VisionStatus::Idle
            || self.probe != ProbeStatus::Idle
            || self.program != ProgramStatus::Idle
            || self.provision != ProvisionStatus::Idle
            || self.test != TestStatus::Idle
    }

    pub fn is_processing(&self) -> bool {
        self.vision.is_running()
            || self.probe.is_running()
            || self.program.is_running()
            || self.provision.is_running()
            || self.test.is_running()
    }

    pub fn has_failure(&self) -> bool {
        self.vision.is_failed()
            || self.probe.is_failed()
            || self.program.is_failed()
            || self.provision.is_failed()
            || self.test.is_failed()
    }

    fn is_interrupted(&self) -> bool {
        self.probe == ProbeStatus::Interrupted
            || self.program == ProgramStatus::Interrupted
            || self.provision == ProvisionStatus::Interrupted
            || self.test == TestStatus::Interrupted
    }

    /// Display text for probe, program, provision and test, with the failure
    /// reason appended to the failed phase.
    pub fn status_text(&self) -> [String; 4] {
        if !self.enabled {
            return ["DISABLED".into(), String::new(), String::new(), String::new()];
        }
        let with_reason = |text: String, failed: bool| match (&self.failure_reason, failed) {
            (Some(reason), true) => format!("{text} ({reason})"),
            _ => text,
        };
        [
            with_reason(self.probe.to_string(), self.probe.is_failed()),
            with_reason(self.program.to_string(), self.program.is_failed()),
            with_reason(self.provision.to_string(), self.provision.is_failed()),
            with_reason(self.test.to_string(), self.test.is_failed()),
        ]
    }

    /// Legacy grid cell colour.
    ///
    /// Priority: disabled, interrupted, completions (latest phase first),
    /// failures, soft skips, in-progress, vision passed, pending.
    pub fn background_color(&self) -> Rgba {
        if !self.enabled {
            return COLOR_DISABLED;
        }
        if self.is_interrupted() {
            return COLOR_INTERRUPTED;
        }

        if self.test == TestStatus::Completed {
            return COLOR_TESTED;
        }
        if self.provision == ProvisionStatus::Completed {
            return COLOR_PROVISIONED;
        }
        if self.program == ProgramStatus::Identified {
            return COLOR_IDENTIFIED;
        }
        if self.program == ProgramStatus::Completed {
            return COLOR_PROGRAMMED;
        }

        if self.test.is_failed()
            || self.provision.is_failed()
            || self.program.is_failed()
            || self.probe.is_failed()
        {
            return COLOR_FAILED;
        }
        if self.vision.is_failed() {
            return COLOR_VISION_FAILED;
        }

        if self.probe == ProbeStatus::Skipped
            || self.program == ProgramStatus::Skipped
            || self.provision == ProvisionStatus::Skipped
            || self.test == TestStatus::Skipped
        {
            return COLOR_FAILED;
        }

        if self.test.is_running() || self.probe.is_running() {
            return COLOR_TESTING;
        }
        if self.provision.is_running() {
            return COLOR_PROVISIONING;
        }
        if self.program.is_running() {
            return COLOR_PROGRAMMING;
        }
        if self.vision.is_running() {
            return COLOR_SCANNING;
        }
        if self.vision == VisionStatus::Passed {
            return COLOR_VISION_PASSED;
        }
        COLOR_PENDING
    }

    /// Result classification plus the failing phase, or `None` for a board
    /// that was never touched this cycle.
    pub fn outcome(&self) -> Option<(Outcome, Option<&'static str>)> {
        if !self.is_touched() {
            return None;
        }
        let failed_phase = if self.vision.is_failed() {
            Some("Vision")
        } else if self.probe.is_failed() {
            Some("Contact")
        } else if self.program.is_failed() {
            Some("Program")
        } else if self.provision.is_failed() {
            Some("Provisioning")
        } else if self.test.is_failed() {
            Some("Test")
        } else {
            None
        };

        if failed_phase.is_some() {
            return Some((Outcome::Failed, failed_phase));
        }
        if self.is_interrupted() {
            return Some((Outcome::Failed, Some("Interrupted")));
        }
        if self.vision == VisionStatus::Skipped
            || self.probe == ProbeStatus::Skipped
        {
            return Some((Outcome::Skipped, None));
        }
        Some((Outcome::Passed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut board = BoardStatus::new(0, 1);
        assert!(board.set_probe(ProbeStatus::Probing));
        assert!(board.set_probe(ProbeStatus::Failed));

        assert!(!board.set_probe(ProbeStatus::Completed));
        assert_eq!(board.probe(), ProbeStatus::Failed);
    }

    #[test]
    fn test_reset_clears_terminal_status() {
        let mut board = BoardStatus::new(1, 0);
        board.enabled = false;
        board.set_program(ProgramStatus::Completed);
        board.fail("boom");
        board.info_mut().serial_number = Some("SN1".into());

        board.reset();

        assert_eq!(board.program(), ProgramStatus::Idle);
        assert!(board.failure_reason.is_none());
        assert!(board.board_info.is_none());
        assert!(!board.enabled);
    }

    #[test]
    fn test_rerun_reset_keeps_scan_result() {
        let mut scanned = BoardStatus::new(0, 0);
        scanned.set_vision(VisionStatus::Passed);
        scanned.info_mut().serial_number = Some("SN7".into());
        scanned.info_mut().test_data.insert("mac".into(), "AA".into());
        scanned.set_program(ProgramStatus::Completed);

        scanned.reset_for_rerun();

        assert_eq!(scanned.vision(), VisionStatus::Passed);
        assert_eq!(scanned.program(), ProgramStatus::Idle);
        let info = scanned.board_info.as_ref().unwrap();
        assert_eq!(info.serial_number.as_deref(), Some("SN7"));
        assert!(info.test_data.is_empty());

        let mut unreadable = BoardStatus::new(0, 1);
        unreadable.set_vision(VisionStatus::Failed);
        unreadable.fail("No QR code");
        unreadable.set_probe(ProbeStatus::Skipped);

        unreadable.reset_for_rerun();

        assert_eq!(unreadable.vision(), VisionStatus::Failed);
        assert_eq!(unreadable.probe(), ProbeStatus::Idle);
        assert_eq!(unreadable.failure_reason.as_deref(), Some("No QR code"));
    }

    #[test]
    fn test_status_text_carries_reason() {
        let mut board = BoardStatus::new(0, 0);
        board.set_probe(ProbeStatus::Failed);
        board.fail("no contact");

        let text = board.status_text();
        assert_eq!(text[0], "Contact Failed (no contact)");
        assert_eq!(text[1], "Pending");

        board.enabled = false;
        assert_eq!(board.status_text()[0], "DISABLED");
    }

    #[test]
    fn test_background_color_priority() {
        let mut board = BoardStatus::new(0, 0);
        assert_eq!(board.background_color(), COLOR_PENDING);

        board.set_vision(VisionStatus::Passed);
        assert_eq!(board.background_color(), COLOR_VISION_PASSED);

        board.set_program(ProgramStatus::Programming);
        assert_eq!(board.background_color(), COLOR_PROGRAMMING);

        board.set_program(ProgramStatus::Completed);
        assert_eq!(board.background_color(), COLOR_PROGRAMMED);

        board.set_test(TestStatus::Failed);
        assert_eq!(board.background_color(), COLOR_PROGRAMMED);

        board.set_provision(ProvisionStatus::Completed);
        assert_eq!(board.background_color(), COLOR_PROVISIONED);

        board.enabled = false;
        assert_eq!(board.background_color(), COLOR_DISABLED);
    }

    #[test]
    fn test_identified_is_purple() {
        let mut board = BoardStatus::new(0, 0);
        board.set_program(ProgramStatus::Identified);
        assert_eq!(board.background_color(), COLOR_IDENTIFIED);
    }

    #[test]
    fn test_outcome_classification() {
        let untouched = BoardStatus::new(0, 0);
        assert_eq!(untouched.outcome(), None);

        let mut skipped = BoardStatus::new(0, 1);
        skipped.set_probe(ProbeStatus::Skipped);
        skipped.set_program(ProgramStatus::Skipped);
        assert_eq!(skipped.outcome(), Some((Outcome::Skipped, None)));

        let mut failed = BoardStatus::new(1, 0);
        failed.set_probe(ProbeStatus::Completed);
        failed.set_program(ProgramStatus::Failed);
        assert_eq!(failed.outcome(), Some((Outcome::Failed, Some("Program"))));

        let mut passed = BoardStatus::new(1, 1);
        passed.set_probe(ProbeStatus::Completed);
        passed.set_program(ProgramStatus::Completed);
        assert_eq!(passed.outcome(), Some((Outcome::Passed, None)));
    }

    #[test]
    fn test_interrupt_marks_running_phases() {
        let mut board = BoardStatus::new(0, 0);
        board.set_probe(ProbeStatus::Completed);
        board.set_program(ProgramStatus::Programming);

        board.interrupt();

        assert_eq!(board.probe(), ProbeStatus::Completed);
        assert_eq!(board.program(), ProgramStatus::Interrupted);
        assert_eq!(board.background_color(), COLOR_INTERRUPTED);
        assert!(!board.is_processing());
    }

    #[test]
    fn test_to_record_flattens_captures() {
        let mut info = BoardInfo::new(Some("SN42".into()), (1, 3));
        info.program_result = Some(true);
        info.test_data.insert("mac".into(), "AA:BB".into());

        let record = info.to_record();
        assert_eq!(record["serial_number"], "SN42");
        assert_eq!(record["position_col"], "1");
        assert_eq!(record["position_row"], "3");
        assert_eq!(record["program_result"], "true");
        assert_eq!(record["probe_result"], "");
        assert_eq!(record["mac"], "AA:BB");
    }
}
