//! Orchestrator notifications.
//!
//! The orchestrator publishes through an [`EventBus`]; front ends register a
//! [`ProgBotObserver`]. Observers are called inline from the cycle task and
//! must not block. A UI running on its own thread should use
//! [`ChannelObserver`], which only posts onto a channel.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::board::{BoardStatus, Rgba};
use crate::controllers::PhaseSink;

/// Error payload for the operator: enough context to abort, retry the
/// board, or skip it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    /// Rendered error source chain, outermost first.
    pub traceback: String,
    pub col: Option<u32>,
    pub row: Option<u32>,
}

impl ErrorInfo {
    pub fn from_error(err: &(dyn StdError + 'static), position: Option<(u32, u32)>) -> Self {
        let mut chain = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            traceback: chain.join("\n"),
            col: position.map(|p| p.0),
            row: position.map(|p| p.1),
        }
    }
}

/// Everything the orchestrator announces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgBotEvent {
    PhaseChanged { phase: String },
    PanelChanged { cols: u32, rows: u32 },
    BoardStatusChanged { cell_id: u32, status: BoardStatus },
    /// Legacy grid colouring, sent alongside every status change.
    CellColorChanged { cell_id: u32, color: Rgba },
    ErrorOccurred(ErrorInfo),
    StatsUpdated { text: String },
    QrScanStarted,
    QrScanEnded,
}

/// Receives orchestrator events. Every method defaults to a no-op.
pub trait ProgBotObserver: Send + Sync {
    /// Entry point used by the bus. Override to handle events generically.
    fn notify(&self, event: &ProgBotEvent) {
        match event {
            ProgBotEvent::PhaseChanged { phase } => self.on_phase_changed(phase),
            ProgBotEvent::PanelChanged { cols, rows } => self.on_panel_changed(*cols, *rows),
            ProgBotEvent::BoardStatusChanged { cell_id, status } => {
                self.on_board_status_changed(*cell_id, status)
            }
            ProgBotEvent::CellColorChanged { cell_id, color } => {
                self.on_cell_color_changed(*cell_id, *color)
            }
            ProgBotEvent::ErrorOccurred(info) => self.on_error(info),
            ProgBotEvent::StatsUpdated { text } => self.on_stats_updated(text),
            ProgBotEvent::QrScanStarted => self.on_qr_scan_started(),
            ProgBotEvent::QrScanEnded => self.on_qr_scan_ended(),
        }
    }

    fn on_phase_changed(&self, _phase: &str) {}

    fn on_panel_changed(&self, _cols: u32, _rows: u32) {}

    fn on_board_status_changed(&self, _cell_id: u32, _status: &BoardStatus) {}

    fn on_cell_color_changed(&self, _cell_id: u32, _color: Rgba) {}

    fn on_error(&self, _info: &ErrorInfo) {}

    fn on_stats_updated(&self, _text: &str) {}

    fn on_qr_scan_started(&self) {}

    fn on_qr_scan_ended(&self) {}
}

/// Fan-out to every subscribed observer, in subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn ProgBotObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn ProgBotObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn emit(&self, event: ProgBotEvent) {
        for observer in &self.observers {
            observer.notify(&event);
        }
    }

    pub fn phase_changed(&self, phase: impl Into<String>) {
        let phase = phase.into();
        info!(phase = %phase, "phase");
        self.emit(ProgBotEvent::PhaseChanged { phase });
    }

    pub fn panel_changed(&self, cols: u32, rows: u32) {
        self.emit(ProgBotEvent::PanelChanged { cols, rows });
    }

    /// Publish a status snapshot plus its legacy cell colour.
    pub fn board_status_changed(&self, cell_id: u32, status: &BoardStatus) {
        self.emit(ProgBotEvent::BoardStatusChanged {
            cell_id,
            status: status.clone(),
        });
        self.emit(ProgBotEvent::CellColorChanged {
            cell_id,
            color: status.background_color(),
        });
    }

    pub fn error_occurred(&self, info: ErrorInfo) {
        self.emit(ProgBotEvent::ErrorOccurred(info));
    }

    pub fn stats_updated(&self, text: impl Into<String>) {
        self.emit(ProgBotEvent::StatsUpdated { text: text.into() });
    }

    pub fn qr_scan_started(&self) {
        self.emit(ProgBotEvent::QrScanStarted);
    }

    pub fn qr_scan_ended(&self) {
        self.emit(ProgBotEvent::QrScanEnded);
    }
}

impl PhaseSink for EventBus {
    fn phase(&self, text: &str) {
        self.phase_changed(text);
    }
}

/// Posts every event onto an unbounded channel. Sending never blocks; events
/// are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgBotEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgBotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgBotObserver for ChannelObserver {
    fn notify(&self, event: &ProgBotEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// Logs events through `tracing`, for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgBotObserver for TracingObserver {
    fn on_board_status_changed(&self, cell_id: u32, status: &BoardStatus) {
        let [probe, program, provision, test] = status.status_text();
        info!(
            cell_id,
            col = status.col,
            row = status.row,
            vision = %status.vision(),
            probe = %probe,
            program = %program,
            provision = %provision,
            test = %test,
            "board status"
        );
    }

    fn on_error(&self, info: &ErrorInfo) {
        error!(
            col = ?info.col,
            row = ?info.row,
            traceback = %info.traceback,
            "{}",
            info.message
        );
    }

    fn on_stats_updated(&self, text: &str) {
        info!("{}", text);
    }

    fn on_qr_scan_started(&self) {
        debug!("QR scan pass started");
    }

    fn on_qr_scan_ended(&self) {
        debug!("QR scan pass ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ProbeStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Phases(Mutex<Vec<String>>);

    impl ProgBotObserver for Phases {
        fn on_phase_changed(&self, phase: &str) {
            self.0.lock().unwrap().push(phase.to_string());
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("probe failed at (0, 1)")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_bus_fans_out_in_order() {
        let first = Arc::new(Phases::default());
        let second = Arc::new(Phases::default());
        let mut bus = EventBus::new();
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        bus.phase("Homing");
        bus.stats_updated("ignored by Phases");

        assert_eq!(*first.0.lock().unwrap(), vec!["Homing"]);
        assert_eq!(*second.0.lock().unwrap(), vec!["Homing"]);
    }

    #[tokio::test]
    async fn test_channel_observer_posts_status_and_color() {
        let (observer, mut rx) = ChannelObserver::new();
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(observer));

        let mut status = BoardStatus::new(0, 1);
        status.set_probe(ProbeStatus::Probing);
        bus.board_status_changed(1, &status);

        match rx.recv().await {
            Some(ProgBotEvent::BoardStatusChanged { cell_id, status }) => {
                assert_eq!(cell_id, 1);
                assert_eq!(status.probe(), ProbeStatus::Probing);
            }
            other => panic!("expected BoardStatusChanged, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(ProgBotEvent::CellColorChanged { cell_id: 1, .. })
        ));
    }

    #[test]
    fn test_error_info_renders_source_chain() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::TimedOut, "serial timeout"));
        let info = ErrorInfo::from_error(&err, Some((0, 1)));

        assert_eq!(info.message, "probe failed at (0, 1)");
        assert_eq!(
            info.traceback,
            "probe failed at (0, 1)\ncaused by: serial timeout"
        );
        assert_eq!((info.col, info.row), (Some(0), Some(1)));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_value(ProgBotEvent::PanelChanged { cols: 2, rows: 5 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "panel_changed", "cols": 2, "rows": 5}));
    }
}
