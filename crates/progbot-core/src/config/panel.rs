//! `.panel` files: geometry, mode and provisioning for one panel design.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use super::error::{ConfigError, ConfigResult};
use super::OperationMode;
use crate::provisioning::ProvisionScript;

/// Serde helpers for numbers that may arrive as strings.
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match NumOrStr::deserialize(d)? {
            NumOrStr::Num(n) => Ok(n),
            NumOrStr::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("expected a number, got {s:?}"))),
        }
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let n = f64(d)?;
        if n.fract() != 0.0 || n < 0.0 || n > f64::from(u32::MAX) {
            return Err(D::Error::custom(format!("expected a count, got {n}")));
        }
        Ok(n as u32)
    }
}

/// Provisioning section of a panel file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSection {
    pub enabled: bool,
    pub script: Option<ProvisionScript>,
    /// Panel-defined `{name}` values.
    pub custom_variables: BTreeMap<String, String>,
}

/// Skip positions are written as `[col, row]` pairs.
fn skip_positions<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(u32, u32)>, D::Error> {
    let pairs: Vec<[u32; 2]> = Vec::deserialize(d)?;
    Ok(pairs.into_iter().map(|[c, r]| (c, r)).collect())
}

/// Serde model of a panel file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelFile {
    /// Display name; defaults to the file stem.
    pub name: Option<String>,

    #[serde(deserialize_with = "lenient::u32")]
    pub board_cols: u32,
    #[serde(deserialize_with = "lenient::u32")]
    pub board_rows: u32,
    #[serde(deserialize_with = "lenient::f64")]
    pub col_width: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub row_height: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub board_x: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub board_y: f64,
    /// Probe plane to board surface, mm.
    #[serde(deserialize_with = "lenient::f64")]
    pub probe_plane: f64,

    pub operation_mode: OperationMode,

    #[serde(deserialize_with = "skip_positions")]
    pub skip_board_pos: Vec<(u32, u32)>,

    pub network_core_firmware: PathBuf,
    pub main_core_firmware: PathBuf,

    pub use_camera: bool,
    /// Flash (or identify) boards. Off leaves programming skipped.
    pub programming_enabled: bool,
    /// Run the target test in modes that test.
    pub test_enabled: bool,
    #[serde(deserialize_with = "lenient::f64")]
    pub qr_offset_x: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub qr_offset_y: f64,

    pub provision: ProvisionSection,
}

impl Default for PanelFile {
    fn default() -> Self {
        Self {
            name: None,
            board_cols: 2,
            board_rows: 5,
            col_width: 48.0,
            row_height: 29.0,
            board_x: 110.2,
            board_y: 121.0,
            probe_plane: 4.0,
            operation_mode: OperationMode::Program,
            skip_board_pos: Vec::new(),
            network_core_firmware: PathBuf::from("merged_CPUNET.hex"),
            main_core_firmware: PathBuf::from("merged.hex"),
            use_camera: false,
            programming_enabled: true,
            test_enabled: true,
            qr_offset_x: 0.0,
            qr_offset_y: 0.0,
            provision: ProvisionSection::default(),
        }
    }
}

impl PanelFile {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load a panel file. Relative firmware paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut panel = Self::from_json(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        if panel.name.is_none() {
            panel.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
        }
        if let Some(dir) = path.parent() {
            for fw in [&mut panel.network_core_firmware, &mut panel.main_core_firmware] {
                if fw.is_relative() {
                    *fw = dir.join(&*fw);
                }
            }
        }
        info!(
            path = %path.display(),
            cols = panel.board_cols,
            rows = panel.board_rows,
            mode = %panel.operation_mode,
            "loaded panel"
        );
        Ok(panel)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}
