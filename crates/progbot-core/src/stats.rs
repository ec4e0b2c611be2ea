//! Counters and per-phase timings for one cycle.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::Instant;

use crate::board::Outcome;

/// Seconds spent in each phase of one board.
pub type PhaseTimes = BTreeMap<String, f64>;

/// Running aggregate for the current cycle. Purely additive until the next
/// [`CycleStats::start`].
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub boards_total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    started: Option<Instant>,
    finished: Option<Instant>,
    started_at: Option<DateTime<Local>>,
    finished_at: Option<DateTime<Local>>,
    board_times: BTreeMap<(u32, u32), PhaseTimes>,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and start timing a cycle over `boards_total` positions.
    pub fn start(&mut self, boards_total: u32) {
        *self = Self {
            boards_total,
            started: Some(Instant::now()),
            started_at: Some(Local::now()),
            ..Self::default()
        };
    }

    pub fn finish(&mut self) {
        self.finished = Some(Instant::now());
        self.finished_at = Some(Local::now());
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.finished.is_none()
    }

    /// Add `elapsed` to `phase` of the board at `(col, row)`.
    pub fn record_phase(&mut self, col: u32, row: u32, phase: &str, elapsed: Duration) {
        *self
            .board_times
            .entry((col, row))
            .or_default()
            .entry(phase.to_string())
            .or_insert(0.0) += elapsed.as_secs_f64();
    }

    pub fn record_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    /// Boards with a recorded outcome.
    pub fn boards_done(&self) -> u32 {
        self.passed + self.failed + self.skipped
    }

    /// Time since start, frozen once finished.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Local>> {
        self.finished_at
    }

    pub fn board_times(&self, col: u32, row: u32) -> Option<&PhaseTimes> {
        self.board_times.get(&(col, row))
    }

    pub fn all_board_times(&self) -> &BTreeMap<(u32, u32), PhaseTimes> {
        &self.board_times
    }

    /// Mean seconds per processed (non-skipped) board.
    pub fn average_board_secs(&self) -> Option<f64> {
        let processed = self.passed + self.failed;
        if processed == 0 {
            return None;
        }
        let total: f64 = self
            .board_times
            .values()
            .flat_map(|phases| phases.values())
            .sum();
        Some(total / f64::from(processed))
    }

    /// One-line status for the operator display.
    pub fn summary_text(&self) -> String {
        let secs = self.elapsed().as_secs();
        let mut text = format!(
            "Boards: {}/{} | Passed: {} | Failed: {} | Skipped: {} | Elapsed: {}m {:02}s",
            self.boards_done(),
            self.boards_total,
            self.passed,
            self.failed,
            self.skipped,
            secs / 60,
            secs % 60,
        );
        if let Some(avg) = self.average_board_secs() {
            text.push_str(&format!(" | Avg: {avg:.1}s/board"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counts_and_elapsed() {
        let mut stats = CycleStats::new();
        stats.start(4);
        stats.record_outcome(Outcome::Passed);
        stats.record_outcome(Outcome::Failed);
        stats.record_outcome(Outcome::Skipped);

        tokio::time::sleep(Duration::from_secs(75)).await;
        stats.finish();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(stats.boards_done(), 3);
        assert_eq!(stats.elapsed(), Duration::from_secs(75));
        assert!(!stats.is_running());
        assert!(stats
            .summary_text()
            .starts_with("Boards: 3/4 | Passed: 1 | Failed: 1 | Skipped: 1 | Elapsed: 1m 15s"));
    }

    #[test]
    fn test_phase_times_accumulate() {
        let mut stats = CycleStats::new();
        stats.record_phase(0, 1, "probe", Duration::from_millis(1500));
        stats.record_phase(0, 1, "probe", Duration::from_millis(500));
        stats.record_phase(0, 1, "program", Duration::from_secs(10));
        stats.record_outcome(Outcome::Passed);

        let times = stats.board_times(0, 1).unwrap();
        assert_eq!(times["probe"], 2.0);
        assert_eq!(times["program"], 10.0);
        assert_eq!(stats.average_board_secs(), Some(12.0));
    }

    #[test]
    fn test_start_resets() {
        let mut stats = CycleStats::new();
        stats.record_outcome(Outcome::Failed);
        stats.record_phase(0, 0, "probe", Duration::from_secs(1));

        stats.start(2);

        assert_eq!(stats.failed, 0);
        assert!(stats.all_board_times().is_empty());
        assert!(stats.is_running());
    }
}
