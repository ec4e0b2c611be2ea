//! Cycle configuration.
//!
//! Two files feed a cycle: machine [`Settings`] (ports, camera offsets,
//! tuning) and a [`PanelFile`] (geometry, mode, provisioning). They merge
//! into an immutable [`Config`] snapshot that is handed to the orchestrator
//! at construction. Nothing reads settings behind its back.

pub mod error;
pub mod panel;
pub mod settings;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provisioning::{ProvisionScript, Variables};
use crate::vision::ScanSettings;

pub use error::{ConfigError, ConfigResult};
pub use panel::{PanelFile, ProvisionSection};
pub use settings::{default_settings, value_as_f64, Settings};

/// What the cycle does once the head has contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationMode {
    #[serde(rename = "Identify Only")]
    IdentifyOnly,
    #[default]
    #[serde(rename = "Program")]
    Program,
    #[serde(rename = "Program & Test")]
    ProgramAndTest,
    #[serde(rename = "Test Only")]
    TestOnly,
}

impl OperationMode {
    pub const ALL: [OperationMode; 4] = [
        Self::IdentifyOnly,
        Self::Program,
        Self::ProgramAndTest,
        Self::TestOnly,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            Self::IdentifyOnly => "Identify Only",
            Self::Program => "Program",
            Self::ProgramAndTest => "Program & Test",
            Self::TestOnly => "Test Only",
        }
    }

    /// Whether the functional test runs.
    pub fn runs_test(self) -> bool {
        matches!(self, Self::ProgramAndTest | Self::TestOnly)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for OperationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.display_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown operation mode {s:?}")))
    }
}

/// Immutable snapshot for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub panel_name: String,

    /// Origin of board (0, 0), mm.
    pub board_x: f64,
    pub board_y: f64,
    pub board_col_width: f64,
    pub board_row_height: f64,
    pub board_num_cols: u32,
    pub board_num_rows: u32,

    /// Added to the probe distance to get the board surface.
    pub probe_plane_to_board: f64,

    /// Y step for contact recovery, mm.
    pub contact_adjust_step: f64,
    /// Multiples of `contact_adjust_step` tried in order when the head
    /// lands without contact.
    pub contact_adjust_pattern: Vec<f64>,

    /// Feed for the final descent onto the board, mm/min.
    pub descend_feed_rate: f64,

    /// Where the stage parks after a cycle.
    pub park_x: f64,
    pub park_y: f64,

    pub operation_mode: OperationMode,
    pub skip_board_pos: Vec<(u32, u32)>,

    pub motion_port: String,
    pub motion_baud: u32,
    pub head_port: String,
    pub head_baud: u32,
    pub target_port: String,
    pub target_baud: u32,

    pub network_core_firmware: PathBuf,
    pub main_core_firmware: PathBuf,

    /// Run the QR pass before probing.
    pub vision_enabled: bool,
    /// Camera position relative to the probe, mm.
    pub camera_offset_x: f64,
    pub camera_offset_y: f64,
    /// QR position relative to the board origin, mm.
    pub qr_offset_x: f64,
    pub qr_offset_y: f64,
    pub qr_scan_timeout: Duration,
    pub qr_retries: u32,
    pub qr_search_offset: f64,

    /// Flash or identify boards.
    pub programming_enabled: bool,
    pub provision_enabled: bool,
    /// Run the target test when the mode tests.
    pub test_enabled: bool,
    pub provision_script: Option<ProvisionScript>,
    pub custom_variables: Variables,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panel_name: "default".into(),
            board_x: 110.2,
            board_y: 121.0,
            board_col_width: 48.0,
            board_row_height: 29.0,
            board_num_cols: 2,
            board_num_rows: 5,
            probe_plane_to_board: 4.0,
            contact_adjust_step: 0.1,
            contact_adjust_pattern: vec![1.0, -1.0, 2.0, -2.0],
            descend_feed_rate: 200.0,
            park_x: 0.0,
            park_y: 300.0,
            operation_mode: OperationMode::Program,
            skip_board_pos: Vec::new(),
            motion_port: "/dev/ttyACM0".into(),
            motion_baud: 115_200,
            head_port: "/dev/ttyUSB0".into(),
            head_baud: 9600,
            target_port: "/dev/ttyACM1".into(),
            target_baud: 115_200,
            network_core_firmware: PathBuf::from("merged_CPUNET.hex"),
            main_core_firmware: PathBuf::from("merged.hex"),
            vision_enabled: false,
            camera_offset_x: 50.0,
            camera_offset_y: 50.0,
            qr_offset_x: 0.0,
            qr_offset_y: 0.0,
            qr_scan_timeout: Duration::from_secs(5),
            qr_retries: 3,
            qr_search_offset: 2.0,
            programming_enabled: true,
            provision_enabled: false,
            test_enabled: true,
            provision_script: None,
            custom_variables: Variables::new(),
        }
    }
}

impl Config {
    /// Merge machine settings and a panel file, then validate.
    pub fn from_sources(settings: &Settings, panel: &PanelFile) -> ConfigResult<Self> {
        let qr_scan_timeout = settings.get_f64("qr_scan_timeout")?;
        let config = Self {
            panel_name: panel.display_name().to_string(),
            board_x: panel.board_x,
            board_y: panel.board_y,
            board_col_width: panel.col_width,
            board_row_height: panel.row_height,
            board_num_cols: panel.board_cols,
            board_num_rows: panel.board_rows,
            probe_plane_to_board: panel.probe_plane,
            contact_adjust_step: settings.get_f64("contact_adjust_step")?,
            descend_feed_rate: settings.get_f64("descend_feed_rate")?,
            park_x: settings.get_f64("park_x")?,
            park_y: settings.get_f64("park_y")?,
            operation_mode: panel.operation_mode,
            skip_board_pos: panel.skip_board_pos.clone(),
            motion_port: settings.get_str("motion_port")?,
            motion_baud: settings.get_u32("motion_baud")?,
            head_port: settings.get_str("head_port")?,
            head_baud: settings.get_u32("head_baud")?,
            target_port: settings.get_str("target_port")?,
            target_baud: settings.get_u32("target_baud")?,
            network_core_firmware: panel.network_core_firmware.clone(),
            main_core_firmware: panel.main_core_firmware.clone(),
            vision_enabled: panel.use_camera,
            camera_offset_x: settings.get_f64("camera_offset_x")?,
            camera_offset_y: settings.get_f64("camera_offset_y")?,
            qr_offset_x: panel.qr_offset_x,
            qr_offset_y: panel.qr_offset_y,
            qr_scan_timeout: Duration::try_from_secs_f64(qr_scan_timeout).map_err(|_| {
                ConfigError::BadSetting {
                    key: "qr_scan_timeout".into(),
                    value: qr_scan_timeout.to_string(),
                }
            })?,
            qr_retries: settings.get_u32("qr_retries")?,
            qr_search_offset: settings.get_f64("qr_search_offset")?,
            programming_enabled: panel.programming_enabled,
            provision_enabled: panel.provision.enabled,
            test_enabled: panel.test_enabled,
            provision_script: panel.provision.script.clone(),
            custom_variables: panel.provision.custom_variables.clone(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject geometry and tuning the fixture cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.board_num_cols == 0 || self.board_num_rows == 0 {
            return invalid(format!(
                "panel must have at least one column and row, got {}x{}",
                self.board_num_cols, self.board_num_rows
            ));
        }
        if self.board_col_width <= 0.0 || self.board_row_height <= 0.0 {
            return invalid("column width and row height must be positive".into());
        }
        if !(0.01..=1.0).contains(&self.contact_adjust_step) {
            return invalid(format!(
                "contact_adjust_step must be within 0.01..=1.0 mm, got {}",
                self.contact_adjust_step
            ));
        }
        if self.descend_feed_rate <= 0.0 {
            return invalid("descend_feed_rate must be positive".into());
        }
        if self.qr_search_offset < 0.0 {
            return invalid("qr_search_offset must not be negative".into());
        }
        if self.qr_scan_timeout.is_zero() || self.qr_scan_timeout > Duration::from_secs(10) {
            return invalid(format!(
                "qr_scan_timeout must be within (0, 10] s, got {:?}",
                self.qr_scan_timeout
            ));
        }
        if let Some((c, r)) = self
            .skip_board_pos
            .iter()
            .find(|(c, r)| *c >= self.board_num_cols || *r >= self.board_num_rows)
        {
            return invalid(format!("skip position [{c}, {r}] is outside the panel"));
        }
        if self.provision_enabled && self.provision_script.is_none() {
            return invalid("provisioning is enabled but the panel has no script".into());
        }
        Ok(())
    }

    /// Column-major cell index.
    pub fn cell_id(&self, col: u32, row: u32) -> u32 {
        col * self.board_num_rows + row
    }

    pub fn contains(&self, col: u32, row: u32) -> bool {
        col < self.board_num_cols && row < self.board_num_rows
    }

    pub fn board_count(&self) -> u32 {
        self.board_num_cols * self.board_num_rows
    }

    /// Probe XY over the board at `(col, row)`.
    pub fn board_position(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.board_x + f64::from(col) * self.board_col_width,
            self.board_y + f64::from(row) * self.board_row_height,
        )
    }

    /// Stage XY that puts the camera over the board's QR code.
    pub fn camera_position(&self, col: u32, row: u32) -> (f64, f64) {
        let (x, y) = self.board_position(col, row);
        (
            x + self.qr_offset_x + self.camera_offset_x,
            y + self.qr_offset_y + self.camera_offset_y,
        )
    }

    pub fn is_skipped(&self, col: u32, row: u32) -> bool {
        self.skip_board_pos.contains(&(col, row))
    }

    /// Y offsets tried, in order, when contact is missing.
    pub fn contact_offsets(&self) -> Vec<f64> {
        self.contact_adjust_pattern
            .iter()
            .map(|m| m * self.contact_adjust_step)
            .collect()
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            retries: self.qr_retries,
            search_offset: self.qr_search_offset,
            scan_timeout: self.qr_scan_timeout,
            ..ScanSettings::default()
        }
    }
}
