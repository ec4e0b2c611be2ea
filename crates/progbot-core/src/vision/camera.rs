//! Camera seam and an external-command backend.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{VisionError, VisionResult};
use crate::process::run_command;

/// Which QR flavour a decoder looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Symbology {
    Standard,
    Micro,
}

/// One encoded image as produced by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
}

/// A camera able to capture frames and decode QR codes in them.
#[async_trait]
pub trait QrCamera: Send + Sync {
    /// Grab a frame. `Ok(None)` when the camera produced nothing.
    async fn capture_frame(&self) -> VisionResult<Option<Frame>>;

    /// Decode one symbology in `frame`.
    async fn detect(&self, frame: &Frame, symbology: Symbology) -> VisionResult<Option<String>>;

    /// Discard stale buffered frames after a move.
    async fn drain_buffer(&self) {}

    /// Stop any live preview.
    async fn stop_preview(&self) {}
}

/// Placeholder replaced by the frame path in decode commands.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Shells out for capture and decoding.
///
/// The capture command writes an encoded image to stdout. Each decode
/// command receives the image path through `{path}` and prints the decoded
/// text, exiting non-zero or printing nothing when no code is found.
///
/// ```ignore
/// let camera = CommandCamera::new(
///     vec!["rpicam-still".into(), "-n".into(), "-o".into(), "-".into()],
///     vec!["zbarimg".into(), "-q".into(), "--raw".into(), "{path}".into()],
/// );
/// ```
#[derive(Debug, Clone)]
pub struct CommandCamera {
    capture: Vec<String>,
    decode_standard: Vec<String>,
    decode_micro: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandCamera {
    pub fn new(capture: Vec<String>, decode_standard: Vec<String>) -> Self {
        Self {
            capture,
            decode_standard,
            decode_micro: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Decoder for micro QR. Without one, micro detection always misses.
    pub fn with_micro_decoder(mut self, decode: Vec<String>) -> Self {
        self.decode_micro = Some(decode);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl QrCamera for CommandCamera {
    async fn capture_frame(&self) -> VisionResult<Option<Frame>> {
        let out = run_command(&self.capture, self.timeout).await?;
        if !out.passed() {
            return Err(VisionError::Capture(format!(
                "`{}` exited {}: {}",
                out.command,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        if out.stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame { bytes: out.stdout }))
    }

    async fn detect(&self, frame: &Frame, symbology: Symbology) -> VisionResult<Option<String>> {
        let template = match symbology {
            Symbology::Standard => &self.decode_standard,
            Symbology::Micro => match &self.decode_micro {
                Some(cmd) => cmd,
                None => return Ok(None),
            },
        };

        let mut file = tempfile::Builder::new()
            .prefix("progbot-frame-")
            .tempfile()?;
        file.write_all(&frame.bytes)?;
        file.flush()?;
        let path = file.path().display().to_string();

        let argv: Vec<String> = template
            .iter()
            .map(|arg| arg.replace(PATH_PLACEHOLDER, &path))
            .collect();
        let out = run_command(&argv, self.timeout)
            .await
            .map_err(|e| VisionError::Decode(e.to_string()))?;

        let text = out.stdout_text();
        debug!(?symbology, exit_code = out.exit_code, decoded = %text, "decode finished");
        if out.passed() && !text.is_empty() {
            Ok(Some(text))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_capture_reads_stdout() {
        let camera = CommandCamera::new(argv(&["printf", "IMG"]), argv(&["true"]));
        let frame = camera.capture_frame().await.unwrap().unwrap();
        assert_eq!(frame.bytes, b"IMG");
    }

    #[tokio::test]
    async fn test_failed_capture_is_error() {
        let camera = CommandCamera::new(argv(&["false"]), argv(&["true"]));
        assert!(matches!(
            camera.capture_frame().await,
            Err(VisionError::Capture(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_gets_frame_path() {
        // `cat {path}` echoes the frame back as the "decoded" text.
        let camera = CommandCamera::new(argv(&["true"]), argv(&["cat", "{path}"]));
        let frame = Frame {
            bytes: b"SN-0042\n".to_vec(),
        };

        let decoded = camera.detect(&frame, Symbology::Standard).await.unwrap();
        assert_eq!(decoded.as_deref(), Some("SN-0042"));
    }

    #[tokio::test]
    async fn test_micro_without_decoder_misses() {
        let camera = CommandCamera::new(argv(&["true"]), argv(&["cat", "{path}"]));
        let frame = Frame {
            bytes: b"SN".to_vec(),
        };
        assert_eq!(camera.detect(&frame, Symbology::Micro).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_decode_output_misses() {
        let camera = CommandCamera::new(argv(&["true"]), argv(&["true"]));
        let frame = Frame { bytes: vec![0] };
        assert_eq!(camera.detect(&frame, Symbology::Standard).await.unwrap(), None);
    }
}
