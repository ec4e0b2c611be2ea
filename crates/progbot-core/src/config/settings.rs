//! Machine-level settings: a flat JSON key/value file.
//!
//! Existing files store most numbers as strings (`"board_cols": "2"`), so
//! the typed getters accept both.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::error::{ConfigError, ConfigResult};

/// Key/value settings, optionally backed by a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    path: Option<PathBuf>,
    data: Map<String, Value>,
}

/// Values used when a key is absent from the file.
pub fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "motion_port": "/dev/ttyACM0",
        "motion_baud": 115200,
        "head_port": "/dev/ttyUSB0",
        "head_baud": 9600,
        "target_port": "/dev/ttyACM1",
        "target_baud": 115200,
        "camera_offset_x": 50.0,
        "camera_offset_y": 50.0,
        "qr_scan_timeout": 5.0,
        "qr_search_offset": 2.0,
        "qr_retries": 3,
        "contact_adjust_step": 0.1,
        "descend_feed_rate": 200.0,
        "park_x": 0.0,
        "park_y": 300.0,
        "programmer": "nrfutil",
        "programmer_timeout": 120.0,
        "camera_capture_command": [],
        "camera_decode_command": [],
        "camera_micro_decode_command": [],
        "export_dir": "",
        "export_format": "csv",
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Settings {
    /// Defaults only, never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: default_settings(),
        }
    }

    /// Load `path` over the defaults. A missing file yields the defaults and
    /// is created on the first [`set`](Self::set).
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = default_settings();

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let loaded: Map<String, Value> =
                    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                        path: path.clone(),
                        source,
                    })?;
                info!(path = %path.display(), keys = loaded.len(), "loaded settings");
                data.extend(loaded);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        }

        Ok(Self {
            path: Some(path),
            data,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set `key` and persist when file-backed.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> ConfigResult<()> {
        self.data.insert(key.to_string(), value.into());
        self.save()
    }

    fn save(&self) -> ConfigResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&self.data).map_err(|source| ConfigError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "saved settings");
        Ok(())
    }

    fn bad(&self, key: &str) -> ConfigError {
        ConfigError::BadSetting {
            key: key.to_string(),
            value: self
                .data
                .get(key)
                .map(Value::to_string)
                .unwrap_or_else(|| "<missing>".into()),
        }
    }

    pub fn get_f64(&self, key: &str) -> ConfigResult<f64> {
        self.data
            .get(key)
            .and_then(value_as_f64)
            .ok_or_else(|| self.bad(key))
    }

    pub fn get_u32(&self, key: &str) -> ConfigResult<u32> {
        self.data
            .get(key)
            .and_then(value_as_f64)
            .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= f64::from(u32::MAX))
            .map(|v| v as u32)
            .ok_or_else(|| self.bad(key))
    }

    pub fn get_str(&self, key: &str) -> ConfigResult<String> {
        match self.data.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(self.bad(key)),
        }
    }

    /// An argv-style list. A plain string is split on whitespace.
    pub fn get_command(&self, key: &str) -> ConfigResult<Vec<String>> {
        match self.data.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| self.bad(key)),
            Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
            None | Some(Value::Null) => Ok(Vec::new()),
            _ => Err(self.bad(key)),
        }
    }
}

/// A number, or a string holding one.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
