//! Programmer head: pogo-pin contact sense and target power rails.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{ControllerError, ControllerResult};
use super::link::DeviceLink;
use super::HeadControl;
use crate::device::{DeviceConnector, DEFAULT_COMMAND_TIMEOUT};

/// Acknowledgement token for power and logic commands.
pub const HEAD_ACK: &str = "OK";
/// Contact query reply token when the pins touch a header.
pub const HEAD_PRESENT: &str = "PRESENT";
/// Reply token for a head-side fault.
pub const HEAD_ERROR: &str = "ERROR";

/// The head firmware drops the odd command at 9600 baud.
const HEAD_RETRIES: u32 = 3;

/// Programmer head controller.
pub struct HeadController {
    link: Mutex<DeviceLink>,
}

impl HeadController {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            link: Mutex::new(DeviceLink::new("head", connector)),
        }
    }

    async fn query(&self, command: &str) -> ControllerResult<String> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        let reply = device
            .send_command(command, DEFAULT_COMMAND_TIMEOUT, HEAD_RETRIES)
            .await?;
        debug!(command, reply = %reply, "head reply");
        Ok(reply)
    }

    async fn switch(&self, on: &str, off: &str, enable: bool) -> ControllerResult<()> {
        let command = if enable { on } else { off };
        let reply = self.query(command).await?;
        if !reply.contains(HEAD_ACK) {
            return Err(ControllerError::UnexpectedReply {
                device: "head",
                command: command.to_string(),
                reply,
                expected: HEAD_ACK,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HeadControl for HeadController {
    async fn connect(&self) -> ControllerResult<()> {
        self.link.lock().await.ensure_connected().await?;
        Ok(())
    }

    async fn check_contact(&self) -> ControllerResult<bool> {
        let reply = self.query("Stat").await?;
        if reply.contains(HEAD_ERROR) {
            return Err(ControllerError::HeadFault {
                command: "Stat".to_string(),
                reply,
            });
        }
        let contacted = reply.contains(HEAD_PRESENT);
        info!(contacted, "contact check");
        Ok(contacted)
    }

    async fn set_power(&self, enable: bool) -> ControllerResult<()> {
        self.switch("PowerOn", "PowerOff", enable).await
    }

    async fn set_logic(&self, enable: bool) -> ControllerResult<()> {
        self.switch("LogicOn", "LogicOff", enable).await
    }

    async fn set_all(&self, enable: bool) -> ControllerResult<()> {
        self.switch("AllOn", "AllOff", enable).await
    }

    async fn disconnect(&self) {
        self.link.lock().await.disconnect().await;
    }
}
