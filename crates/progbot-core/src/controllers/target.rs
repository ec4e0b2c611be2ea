//! Console UART of the board under the head.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::ControllerResult;
use super::link::DeviceLink;
use super::TargetControl;
use crate::device::{DeviceConnector, DeviceError, DEFAULT_COMMAND_TIMEOUT};
use crate::provisioning::{ProvisionResult, ProvisionScript, ProvisioningEngine, VariableContext};

/// Console command used by the functional check.
pub const TEST_COMMAND: &str = "beep 1";

const TEST_PAUSE: Duration = Duration::from_secs(1);
const MONITOR_POLL: Duration = Duration::from_secs(1);

/// Target console controller.
pub struct TargetController {
    link: Mutex<DeviceLink>,
    engine: ProvisioningEngine,
}

impl TargetController {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            link: Mutex::new(DeviceLink::new("target", connector)),
            engine: ProvisioningEngine::new(),
        }
    }

    async fn beep(&self) -> ControllerResult<Option<String>> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        match device
            .send_command(TEST_COMMAND, DEFAULT_COMMAND_TIMEOUT, 1)
            .await
        {
            Ok(reply) => Ok(Some(reply)),
            Err(DeviceError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TargetControl for TargetController {
    async fn connect(&self) -> ControllerResult<()> {
        self.link.lock().await.ensure_connected().await?;
        Ok(())
    }

    async fn test(&self) -> ControllerResult<bool> {
        let first = self.beep().await?;
        info!(reply = ?first, "target test, first beep");
        tokio::time::sleep(TEST_PAUSE).await;
        let second = self.beep().await?;
        info!(reply = ?second, "target test, second beep");
        Ok(first.is_some() && second.is_some())
    }

    async fn monitor(&self) -> ControllerResult<()> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        let port = device.port().to_string();
        loop {
            match device.read_line(MONITOR_POLL).await {
                Ok(Some(line)) => info!(port = %port, "{}", line),
                Ok(None) => {}
                Err(e) => {
                    warn!(port = %port, error = %e, "target monitor stopped");
                    return Err(e.into());
                }
            }
        }
    }

    async fn provision(
        &self,
        script: &ProvisionScript,
        context: &mut VariableContext,
    ) -> ControllerResult<ProvisionResult> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        Ok(self.engine.execute(script, device.as_mut(), context).await)
    }

    async fn disconnect(&self) {
        self.link.lock().await.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fakes::{FakeConnector, FakeLineDevice};
    use crate::provisioning::{ProvisionStep, Variables};

    #[tokio::test(start_paused = true)]
    async fn test_beeps_twice() {
        let connector = FakeConnector::new(FakeLineDevice::always("ttyACM1", "beep ok"));
        let target = TargetController::new(Arc::new(connector.clone()));

        assert!(target.test().await.unwrap());
        assert_eq!(connector.device().sent(), vec![TEST_COMMAND; 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_target_fails_test() {
        let connector = FakeConnector::new(FakeLineDevice::new("ttyACM1"));
        let target = TargetController::new(Arc::new(connector));
        assert!(!target.test().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_until_dropped() {
        let connector = FakeConnector::new(FakeLineDevice::new("ttyACM1"));
        connector.device().push_line("booting");
        let target = TargetController::new(Arc::new(connector));

        let outcome = tokio::time::timeout(Duration::from_secs(5), target.monitor()).await;
        assert!(outcome.is_err(), "monitor should still be running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_over_console() {
        let connector = FakeConnector::new(FakeLineDevice::with_responder("ttyACM1", |cmd| {
            if cmd == "id" {
                vec!["chip=nRF5340".to_string()]
            } else {
                vec![]
            }
        }));
        let target = TargetController::new(Arc::new(connector));
        let script = ProvisionScript {
            steps: vec![ProvisionStep::exchange("id", "chip=(?P<chip>\\w+)")],
            ..ProvisionScript::default()
        };
        let mut ctx =
            VariableContext::from_parts(Variables::new(), Variables::new(), Variables::new());

        let result = target.provision(&script, &mut ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(ctx.get("chip"), Some("nRF5340"));
    }
}
