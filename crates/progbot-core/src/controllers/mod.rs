//! Hardware controllers driven by the orchestrator.
//!
//! Each controller wraps one line-oriented device and exposes domain verbs:
//! moves and probing on the motion board, contact and power on the
//! programmer head, console access on the target. Every verb follows the same
//! shape: reconnect if the link died, send a command, await one reply line,
//! check it for the expected token.
//!
//! The orchestrator depends only on the traits defined here, so tests swap in
//! the recorders from [`crate::fakes`].

pub mod error;
pub mod head;
pub mod link;
pub mod motion;
pub mod programmer;
pub mod target;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provisioning::{ProvisionResult, ProvisionScript, VariableContext};

pub use error::{ControllerError, ControllerResult};
pub use head::HeadController;
pub use link::DeviceLink;
pub use motion::MotionController;
pub use programmer::NrfutilProgrammer;
pub use target::TargetController;

/// A machine position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Receives human-readable progress text from long-running operations.
pub trait PhaseSink: Send + Sync {
    fn phase(&self, text: &str);
}

/// Motion stage (G-code over serial).
#[async_trait]
pub trait MotionControl: Send + Sync {
    /// Open the link if it is not already open.
    async fn connect(&self) -> ControllerResult<()>;

    /// Clear alarms, optionally home, zero coordinates, retract the probe pin
    /// and select absolute millimetre units.
    async fn init(&self, homing: bool) -> ControllerResult<()>;

    async fn motors_off(&self) -> ControllerResult<()>;

    async fn rapid_xy_abs(&self, x: f64, y: f64) -> ControllerResult<()>;

    async fn rapid_xy_rel(&self, dx: f64, dy: f64) -> ControllerResult<()>;

    async fn rapid_z_abs(&self, z: f64) -> ControllerResult<()>;

    /// Controlled Z move at `feed_rate` mm/min.
    async fn move_z_abs(&self, z: f64, feed_rate: f64) -> ControllerResult<()>;

    /// Deploy the probe, touch down and return the measured distance.
    async fn do_probe(&self) -> ControllerResult<f64>;

    async fn get_position(&self) -> ControllerResult<Position>;

    async fn disconnect(&self);
}

/// Programmer head: contact sense plus power and logic rails.
#[async_trait]
pub trait HeadControl: Send + Sync {
    async fn connect(&self) -> ControllerResult<()>;

    /// Whether the pogo pins touch a board header.
    async fn check_contact(&self) -> ControllerResult<bool>;

    async fn set_power(&self, enable: bool) -> ControllerResult<()>;

    async fn set_logic(&self, enable: bool) -> ControllerResult<()>;

    async fn set_all(&self, enable: bool) -> ControllerResult<()>;

    async fn disconnect(&self);
}

/// The board under test's console UART.
#[async_trait]
pub trait TargetControl: Send + Sync {
    async fn connect(&self) -> ControllerResult<()>;

    /// Functional check. `Ok(false)` when the board does not answer.
    async fn test(&self) -> ControllerResult<bool>;

    /// Log console output until the returned future is dropped.
    async fn monitor(&self) -> ControllerResult<()>;

    /// Run a provisioning script over the console.
    async fn provision(
        &self,
        script: &ProvisionScript,
        context: &mut VariableContext,
    ) -> ControllerResult<ProvisionResult>;

    async fn disconnect(&self);
}

/// Flashes or identifies the board through its debug port.
#[async_trait]
pub trait Programmer: Send + Sync {
    /// Read device info. `Ok(false)` when no device answers.
    async fn identify(&self, phases: &dyn PhaseSink) -> ControllerResult<bool>;

    /// Recover, erase and flash. `Ok(false)` when any step fails.
    async fn program(&self, phases: &dyn PhaseSink) -> ControllerResult<bool>;
}
