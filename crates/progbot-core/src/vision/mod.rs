//! QR scan strategy.
//!
//! Detection itself lives behind [`QrCamera`]. This module only decides how
//! hard to look, cheapest first:
//!
//! 1. fast path: one frame, standard then micro QR, no delays;
//! 2. retries: up to `retries` frames with a pause between them, plus a
//!    throwaway frame when the camera has been idle so exposure can settle;
//! 3. position search: jog to four diagonal offsets around the nominal
//!    position and look again, then return to nominal.
//!
//! The whole scan is bounded by `scan_timeout`.

pub mod camera;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controllers::MotionControl;

pub use camera::{CommandCamera, Frame, QrCamera, Symbology, PATH_PLACEHOLDER};
pub use error::{VisionError, VisionResult};

/// A camera counts as warm this long after its last capture.
pub const WARM_WINDOW: Duration = Duration::from_secs(2);

const THROWAWAY_SETTLE: Duration = Duration::from_millis(50);
const SEARCH_SETTLE: Duration = Duration::from_millis(100);

/// Tuning for one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// Frames to try after the fast path misses.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Diagonal jog in mm for the position search. Zero disables it.
    pub search_offset: f64,
    /// Budget for the whole scan.
    pub scan_timeout: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(500),
            search_offset: 0.0,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

/// Which tier found the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTier {
    FastPath,
    /// 1-based attempt number.
    Retry(u32),
    /// 1-based search position.
    PositionSearch(usize),
}

/// A decoded code and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrScan {
    pub data: String,
    pub tier: ScanTier,
}

/// Runs the escalating scan against one camera.
pub struct VisionController {
    camera: Arc<dyn QrCamera>,
    settings: ScanSettings,
    last_capture: Mutex<Option<Instant>>,
}

impl VisionController {
    pub fn new(camera: Arc<dyn QrCamera>, settings: ScanSettings) -> Self {
        Self {
            camera,
            settings,
            last_capture: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub async fn stop_preview(&self) {
        self.camera.stop_preview().await;
    }

    async fn capture(&self) -> Option<Frame> {
        let result = self.camera.capture_frame().await;
        *self.last_capture.lock().await = Some(Instant::now());
        match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "frame capture failed");
                None
            }
        }
    }

    async fn is_warm(&self) -> bool {
        self.last_capture
            .lock()
            .await
            .is_some_and(|at| at.elapsed() < WARM_WINDOW)
    }

    /// Standard QR first, then micro QR.
    async fn decode(&self, frame: &Frame) -> Option<String> {
        for symbology in [Symbology::Standard, Symbology::Micro] {
            match self.camera.detect(frame, symbology).await {
                Ok(Some(data)) => return Some(data),
                Ok(None) => {}
                Err(e) => debug!(?symbology, error = %e, "decoder error"),
            }
        }
        None
    }

    async fn capture_and_decode(&self) -> Option<String> {
        let frame = self.capture().await?;
        self.decode(&frame).await
    }

    /// Look for a QR code at the current position. `base` is the nominal
    /// camera position, required for the position search.
    pub async fn scan(&self, motion: &dyn MotionControl, base: Option<(f64, f64)>) -> Option<QrScan> {
        let start = Instant::now();
        let deadline = start + self.settings.scan_timeout;
        let warm = self.is_warm().await;

        let found = |data: String, tier: ScanTier| {
            info!(?tier, data = %data, elapsed_ms = start.elapsed().as_millis() as u64, "QR found");
            Some(QrScan { data, tier })
        };

        if let Some(data) = self.capture_and_decode().await {
            return found(data, ScanTier::FastPath);
        }
        debug!("fast path missed");

        for attempt in 1..=self.settings.retries {
            if Instant::now() >= deadline {
                warn!(attempt, "QR scan budget exhausted");
                return None;
            }
            if attempt == 1 && !warm && self.capture().await.is_some() {
                tokio::time::sleep(THROWAWAY_SETTLE).await;
            }
            if let Some(data) = self.capture_and_decode().await {
                return found(data, ScanTier::Retry(attempt));
            }
            debug!(attempt, retries = self.settings.retries, "retry missed");
            if attempt < self.settings.retries {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        let offset = self.settings.search_offset;
        let Some((bx, by)) = base.filter(|_| offset > 0.0) else {
            info!(elapsed_ms = start.elapsed().as_millis() as u64, "QR scan failed");
            return None;
        };

        let positions = [
            (bx - offset, by + offset),
            (bx + offset, by + offset),
            (bx + offset, by - offset),
            (bx - offset, by - offset),
        ];
        let mut result = None;
        for (i, (x, y)) in positions.into_iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(position = i + 1, "QR scan budget exhausted during search");
                break;
            }
            if let Err(e) = motion.rapid_xy_abs(x, y).await {
                warn!(position = i + 1, error = %e, "search move failed");
                continue;
            }
            tokio::time::sleep(SEARCH_SETTLE).await;
            self.camera.drain_buffer().await;
            tokio::time::sleep(SEARCH_SETTLE).await;
            if let Some(data) = self.capture_and_decode().await {
                result = found(data, ScanTier::PositionSearch(i + 1));
                break;
            }
            debug!(position = i + 1, "search position missed");
        }

        if let Err(e) = motion.rapid_xy_abs(bx, by).await {
            warn!(error = %e, "return to scan position failed");
        }
        if result.is_none() {
            info!(elapsed_ms = start.elapsed().as_millis() as u64, "QR scan failed");
        }
        result
    }
}
