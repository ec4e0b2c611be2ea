//! Line-oriented device seam.
//!
//! Every piece of hardware on the fixture (motion board, programmer head,
//! target UART) speaks ASCII lines terminated by `\n`. [`LineDevice`] is the
//! narrow contract the controllers and the provisioning engine depend on:
//! write a line, await the next line with a timeout, drop stale input.
//!
//! [`DeviceConnector`] opens a fresh device so a controller can replace a
//! dead link without the caller noticing.
//!
//! # Modules
//!
//! - [`serial`]: `tokio-serial` backend with a background line reader
//! - [`fakes`]: scripted in-memory device for tests and dry runs
//! - [`error`]: `DeviceError`, `DeviceResult`

pub mod error;
pub mod fakes;
pub mod serial;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use error::{DeviceError, DeviceResult};

/// Pause between attempts of [`LineDevice::send_command`].
pub const COMMAND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default reply timeout for single-line commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, line-oriented device.
#[async_trait]
pub trait LineDevice: Send {
    /// Port identifier, used in logs and errors.
    fn port(&self) -> &str;

    /// Synchronous health check. `false` once the link is known to be dead.
    fn is_open(&self) -> bool;

    /// Write one line. A trailing `\n` is appended when missing.
    async fn write_line(&mut self, line: &str) -> DeviceResult<()>;

    /// Await the next received line.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`, and
    /// `Err(DeviceError::Closed)` when the link is gone and nothing is queued.
    async fn read_line(&mut self, timeout: Duration) -> DeviceResult<Option<String>>;

    /// Discard queued lines. Returns how many were dropped.
    fn drain(&mut self) -> usize;

    /// Close the link. Further writes fail with `Closed`.
    async fn close(&mut self);

    /// Send `command` and await the very next line as its reply.
    ///
    /// `timeout` is the budget for all attempts together; each of the
    /// `retries` attempts (minimum one) gets an equal share. Stale lines are
    /// drained before every write so an old reply is never mistaken for the
    /// new one.
    async fn send_command(
        &mut self,
        command: &str,
        timeout: Duration,
        retries: u32,
    ) -> DeviceResult<String> {
        let attempts = retries.max(1);
        let per_attempt = timeout / attempts;

        for attempt in 1..=attempts {
            let stale = self.drain();
            if stale > 0 {
                warn!(port = %self.port(), stale, "queue had stale lines, cleared");
            }

            self.write_line(command).await?;

            match self.read_line(per_attempt).await? {
                Some(reply) => return Ok(reply),
                None if attempt < attempts => {
                    debug!(
                        port = %self.port(),
                        attempt,
                        attempts,
                        command,
                        "no reply, retrying"
                    );
                    tokio::time::sleep(COMMAND_RETRY_DELAY).await;
                }
                None => {}
            }
        }

        Err(DeviceError::Timeout {
            port: self.port().to_string(),
            attempts,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

/// Opens a [`LineDevice`]. Called once on first use and again whenever the
/// previous device reports itself closed.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Port identifier this connector opens.
    fn port(&self) -> &str;

    /// Open a new device.
    async fn open(&self) -> DeviceResult<Box<dyn LineDevice>>;
}

#[cfg(test)]
mod tests {
    use super::fakes::FakeLineDevice;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_command_returns_first_reply() {
        let mut dev = FakeLineDevice::with_responder("fake0", |cmd| {
            if cmd == "Stat" {
                vec!["PRESENT".to_string()]
            } else {
                vec![]
            }
        });

        let reply = dev
            .send_command("Stat", DEFAULT_COMMAND_TIMEOUT, 1)
            .await
            .unwrap();
        assert_eq!(reply, "PRESENT");
        assert_eq!(dev.sent(), vec!["Stat".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_drains_stale_lines() {
        let mut dev = FakeLineDevice::with_responder("fake0", |_| vec!["OK".to_string()]);
        dev.push_line("leftover from an earlier command");

        let reply = dev
            .send_command("PowerOn", DEFAULT_COMMAND_TIMEOUT, 1)
            .await
            .unwrap();
        assert_eq!(reply, "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_retries_then_times_out() {
        let mut dev = FakeLineDevice::new("silent");

        let err = dev
            .send_command("Stat", Duration::from_secs(3), 3)
            .await
            .unwrap_err();

        assert_eq!(dev.sent().len(), 3);
        match err {
            DeviceError::Timeout {
                attempts,
                timeout_ms,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(timeout_ms, 3000);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_succeeds_on_second_attempt() {
        let mut calls = 0;
        let mut dev = FakeLineDevice::with_responder("flaky", move |_| {
            calls += 1;
            if calls < 2 {
                vec![]
            } else {
                vec!["OK".to_string()]
            }
        });

        let reply = dev
            .send_command("LogicOn", Duration::from_secs(2), 3)
            .await
            .unwrap();
        assert_eq!(reply, "OK");
        assert_eq!(dev.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_device_rejects_writes() {
        let mut dev = FakeLineDevice::new("dead");
        dev.close_link();

        let err = dev.write_line("M18").await.unwrap_err();
        assert!(matches!(err, DeviceError::Closed { .. }));
    }
}
