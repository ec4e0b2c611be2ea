//! End-of-cycle results: per-board outcomes, yield, and file export.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::board::{BoardStatus, Outcome};
use crate::stats::{CycleStats, PhaseTimes};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown export format: {0} (expected csv, json or both)")]
    UnknownFormat(String),
}

pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// Result for one board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardResult {
    /// QR serial, empty when no scan ran.
    pub serial: String,
    pub position: (u32, u32),
    pub cell_id: u32,
    pub result: Outcome,
    pub failure_reason: Option<String>,
    /// Which phase failed: Vision, Contact, Program, Provisioning, Test.
    pub failure_phase: Option<String>,
    pub captured_data: BTreeMap<String, String>,
    pub phase_times: PhaseTimes,
}

impl BoardResult {
    /// Build from a board record. `None` for untouched or disabled boards.
    pub fn from_status(status: &BoardStatus, rows: u32, phase_times: Option<&PhaseTimes>) -> Option<Self> {
        if !status.enabled {
            return None;
        }
        let (result, failure_phase) = status.outcome()?;
        let (serial, captured_data) = match &status.board_info {
            Some(info) => (
                info.serial_number.clone().unwrap_or_default(),
                info.test_data.clone(),
            ),
            None => (String::new(), BTreeMap::new()),
        };
        Some(Self {
            serial,
            position: status.position(),
            cell_id: status.col * rows + status.row,
            result,
            failure_reason: status.failure_reason.clone(),
            failure_phase: failure_phase.map(str::to_string),
            captured_data,
            phase_times: phase_times.cloned().unwrap_or_default(),
        })
    }

    /// Seconds across all phases.
    pub fn total_time(&self) -> f64 {
        self.phase_times.values().sum()
    }
}

/// Results of a completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub timestamp: DateTime<Local>,
    pub panel_name: String,
    pub duration_seconds: f64,
    pub total_boards: u32,
    pub passed_count: u32,
    pub failed_count: u32,
    /// Processed-but-skipped boards plus positions disabled up front.
    pub skipped_count: u32,
    pub boards: Vec<BoardResult>,
}

impl CycleSummary {
    /// Collect the outcome of every touched, enabled board.
    pub fn build<'a>(
        panel_name: &str,
        statuses: impl IntoIterator<Item = &'a BoardStatus>,
        stats: &CycleStats,
        rows: u32,
        disabled_positions: usize,
    ) -> Self {
        let mut boards: Vec<BoardResult> = statuses
            .into_iter()
            .filter_map(|s| BoardResult::from_status(s, rows, stats.board_times(s.col, s.row)))
            .collect();
        boards.sort_by_key(|b| b.cell_id);

        let count = |o: Outcome| boards.iter().filter(|b| b.result == o).count() as u32;
        let passed_count = count(Outcome::Passed);
        let failed_count = count(Outcome::Failed);
        let skipped_count = count(Outcome::Skipped) + disabled_positions as u32;

        Self {
            timestamp: stats.finished_at().unwrap_or_else(Local::now),
            panel_name: panel_name.to_string(),
            duration_seconds: stats.elapsed().as_secs_f64(),
            total_boards: boards.len() as u32,
            passed_count,
            failed_count,
            skipped_count,
            boards,
        }
    }

    pub fn yield_percent(&self) -> f64 {
        if self.total_boards == 0 {
            return 0.0;
        }
        f64::from(self.passed_count) / f64::from(self.total_boards) * 100.0
    }

    pub fn failed_boards(&self) -> impl Iterator<Item = &BoardResult> {
        self.boards.iter().filter(|b| b.result == Outcome::Failed)
    }

    /// Report document with a nested count block.
    pub fn to_json(&self) -> ExportResult<String> {
        let doc = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "panel_name": self.panel_name,
            "duration_seconds": self.duration_seconds,
            "summary": {
                "total": self.total_boards,
                "passed": self.passed_count,
                "failed": self.failed_count,
                "skipped": self.skipped_count,
                "yield_percent": (self.yield_percent() * 10.0).round() / 10.0,
            },
            "boards": self.boards.iter().map(|b| serde_json::json!({
                "serial": b.serial,
                "position": [b.position.0, b.position.1],
                "result": b.result,
                "failure_reason": b.failure_reason,
                "failure_phase": b.failure_phase,
                "captured_data": b.captured_data,
                "phase_times": b.phase_times,
                "total_time": b.total_time(),
            })).collect::<Vec<_>>(),
        });
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Write CSV: fixed columns, then one column per captured key across
    /// all boards, sorted.
    pub fn write_csv<W: std::io::Write>(&self, out: W) -> ExportResult<()> {
        let keys: BTreeSet<&str> = self
            .boards
            .iter()
            .flat_map(|b| b.captured_data.keys().map(String::as_str))
            .collect();

        let mut writer = csv::Writer::from_writer(out);
        let mut header = vec!["serial", "position", "result", "failure_phase", "failure_reason"];
        header.extend(keys.iter().copied());
        writer.write_record(&header)?;

        for b in &self.boards {
            let mut record = vec![
                b.serial.clone(),
                format!("{},{}", b.position.0, b.position.1),
                b.result.to_string(),
                b.failure_phase.clone().unwrap_or_default(),
                b.failure_reason.clone().unwrap_or_default(),
            ];
            record.extend(
                keys.iter()
                    .map(|k| b.captured_data.get(*k).cloned().unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
        writer.flush().map_err(|e| ExportError::Io {
            path: PathBuf::from("<csv>"),
            source: e,
        })?;
        Ok(())
    }

    pub fn to_csv(&self) -> ExportResult<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Receives results as they happen, e.g. to push them to a line database.
#[async_trait]
pub trait CycleResultHandler: Send + Sync {
    async fn on_board_complete(&self, _result: &BoardResult) -> ExportResult<()> {
        Ok(())
    }

    async fn on_cycle_complete(&self, summary: &CycleSummary) -> ExportResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
    Both,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "both" => Ok(Self::Both),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

/// Writes `<YYYYmmdd_HHMMSS>_cycle.{csv,json}` into a directory at cycle end.
#[derive(Debug, Clone)]
pub struct FileExportHandler {
    dir: PathBuf,
    format: ExportFormat,
}

impl FileExportHandler {
    pub fn new(dir: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, summary: &CycleSummary, ext: &str) -> PathBuf {
        let stamp = summary.timestamp.format("%Y%m%d_%H%M%S");
        self.dir.join(format!("{stamp}_cycle.{ext}"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError {
    let path = path.to_path_buf();
    move |source| ExportError::Io { path, source }
}

#[async_trait]
impl CycleResultHandler for FileExportHandler {
    async fn on_cycle_complete(&self, summary: &CycleSummary) -> ExportResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        if matches!(self.format, ExportFormat::Csv | ExportFormat::Both) {
            let path = self.path_for(summary, "csv");
            tokio::fs::write(&path, summary.to_csv()?)
                .await
                .map_err(io_err(&path))?;
            info!(path = %path.display(), "wrote cycle CSV");
        }
        if matches!(self.format, ExportFormat::Json | ExportFormat::Both) {
            let path = self.path_for(summary, "json");
            tokio::fs::write(&path, summary.to_json()?)
                .await
                .map_err(io_err(&path))?;
            info!(path = %path.display(), "wrote cycle JSON");
        }
        Ok(())
    }
}
