//! Lazily connected, self-healing device handle shared by the controllers.

use std::sync::Arc;

use tracing::{info, warn};

use super::error::ControllerResult;
use crate::device::{DeviceConnector, LineDevice};

/// Owns at most one open [`LineDevice`] and replaces it when it dies.
///
/// Controllers keep a `DeviceLink` behind a `tokio::sync::Mutex` and call
/// [`DeviceLink::ensure_connected`] at the start of every operation. A link
/// that dropped since the last call is reopened here, so the caller only
/// sees an error when the port cannot be opened at all.
pub struct DeviceLink {
    name: &'static str,
    connector: Arc<dyn DeviceConnector>,
    device: Option<Box<dyn LineDevice>>,
}

impl DeviceLink {
    pub fn new(name: &'static str, connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            name,
            connector,
            device: None,
        }
    }

    pub fn port(&self) -> &str {
        self.connector.port()
    }

    /// Whether a device is held and reports itself open.
    pub fn is_connected(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_open())
    }

    /// Return the open device, connecting or reconnecting first if needed.
    pub async fn ensure_connected(&mut self) -> ControllerResult<&mut Box<dyn LineDevice>> {
        let device = match self.device.take() {
            Some(device) if device.is_open() => device,
            stale => {
                if stale.is_some() {
                    warn!(device = self.name, port = %self.port(), "connection dead, reconnecting");
                }
                // Release the old handle before the port is reopened.
                drop(stale);
                info!(device = self.name, port = %self.port(), "connecting");
                let device = self.connector.open().await?;
                info!(device = self.name, port = %self.port(), "connected");
                device
            }
        };
        Ok(self.device.insert(device))
    }

    /// Close and forget the device, if any.
    pub async fn disconnect(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close().await;
        }
    }
}
