//! G-code motion board (Smoothieware-style firmware).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::{ControllerError, ControllerResult};
use super::link::DeviceLink;
use super::{MotionControl, Position};
use crate::device::{DeviceConnector, DEFAULT_COMMAND_TIMEOUT};

/// Token every acknowledged G-code reply contains.
pub const MOTION_ACK: &str = "ok";

const HOMING_TIMEOUT: Duration = Duration::from_secs(20);
const MOVE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const POSITION_WINDOW: Duration = Duration::from_secs(2);

/// Deploy BLTouch, probe, stow, wait for motion to finish.
const PROBE_MACRO: &str = "M280 G4 P0.5 G30 M281 G4 P0.5 M400";

/// Motion board controller.
pub struct MotionController {
    link: Mutex<DeviceLink>,
}

impl MotionController {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            link: Mutex::new(DeviceLink::new("motion", connector)),
        }
    }

    async fn send_gcode_wait_ok(&self, command: &str, timeout: Duration) -> ControllerResult<()> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        let reply = device.send_command(command, timeout, 1).await?;
        if !reply.contains(MOTION_ACK) {
            return Err(ControllerError::UnexpectedReply {
                device: "motion",
                command: command.to_string(),
                reply,
                expected: MOTION_ACK,
            });
        }
        Ok(())
    }

    /// Issue a move and block until the planner queue is empty.
    async fn move_and_wait(&self, command: &str) -> ControllerResult<()> {
        self.send_gcode_wait_ok(command, MOVE_TIMEOUT).await?;
        self.send_gcode_wait_ok("M400", DEFAULT_COMMAND_TIMEOUT).await
    }
}

/// Format a coordinate for G-code.
pub fn mm(value: f64) -> String {
    // Avoid "-0.000" for values that round to zero.
    let rounded = (value * 1000.0).round() / 1000.0;
    format!("{:.3}", if rounded == 0.0 { 0.0 } else { rounded })
}

/// Pull the probe distance out of a line such as `Z:4.215 C:12`.
pub fn parse_probe_line(line: &str) -> Option<ControllerResult<f64>> {
    let start = line.find("Z:")? + 2;
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(rest.len());
    Some(
        rest[..end]
            .parse::<f64>()
            .map_err(|_| ControllerError::ProbeParse {
                line: line.to_string(),
            }),
    )
}

/// Parse a status report such as `<Idle|MPos:1.0,2.0,3.0|WPos:0.5,1.5,2.5>`.
/// Work coordinates win over machine coordinates.
pub fn parse_status_line(line: &str) -> Option<Position> {
    parse_coords(line, "WPos:").or_else(|| parse_coords(line, "MPos:"))
}

fn parse_coords(line: &str, key: &str) -> Option<Position> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| matches!(c, '|' | '>' | ' '))
        .unwrap_or(rest.len());
    let mut parts = rest[..end].split(',').map(|p| p.trim().parse::<f64>());
    let x = parts.next()?.ok()?;
    let y = parts.next()?.ok()?;
    let z = parts.next()?.ok()?;
    Some(Position { x, y, z })
}

#[async_trait]
impl MotionControl for MotionController {
    async fn connect(&self) -> ControllerResult<()> {
        self.link.lock().await.ensure_connected().await?;
        Ok(())
    }

    async fn init(&self, homing: bool) -> ControllerResult<()> {
        {
            let mut link = self.link.lock().await;
            let device = link.ensure_connected().await?;
            info!("clearing alarm");
            // Reply content is irrelevant; M999 answers differently per state.
            let reply = device.send_command("M999", DEFAULT_COMMAND_TIMEOUT, 1).await?;
            debug!(reply = %reply, "M999");
        }

        if homing {
            info!("homing");
            self.send_gcode_wait_ok("$H", HOMING_TIMEOUT).await?;
        }

        info!("setting G54 zero");
        self.send_gcode_wait_ok("G92 X0 Y0 Z0", DEFAULT_COMMAND_TIMEOUT)
            .await?;
        info!("retracting probe pin");
        self.send_gcode_wait_ok("M281 G4 P0.5 M400", DEFAULT_COMMAND_TIMEOUT)
            .await?;
        info!("selecting absolute mm coordinates");
        self.send_gcode_wait_ok("G90 G54 G21", DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    async fn motors_off(&self) -> ControllerResult<()> {
        info!("motors off");
        self.send_gcode_wait_ok("M18", DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn rapid_xy_abs(&self, x: f64, y: f64) -> ControllerResult<()> {
        debug!(x, y, "rapid_xy_abs");
        self.move_and_wait(&format!("G90 G0 X{} Y{}", mm(x), mm(y)))
            .await
    }

    async fn rapid_xy_rel(&self, dx: f64, dy: f64) -> ControllerResult<()> {
        debug!(dx, dy, "rapid_xy_rel");
        self.move_and_wait(&format!("G91 G0 X{} Y{}", mm(dx), mm(dy)))
            .await
    }

    async fn rapid_z_abs(&self, z: f64) -> ControllerResult<()> {
        debug!(z, "rapid_z_abs");
        self.move_and_wait(&format!("G90 G0 Z{}", mm(z))).await
    }

    async fn move_z_abs(&self, z: f64, feed_rate: f64) -> ControllerResult<()> {
        debug!(z, feed_rate, "move_z_abs");
        self.move_and_wait(&format!("G90 G1 Z{} F{}", mm(z), mm(feed_rate)))
            .await
    }

    async fn do_probe(&self) -> ControllerResult<f64> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        device.drain();
        device.write_line(PROBE_MACRO).await?;

        let deadline = Instant::now() + PROBE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(line) = device.read_line(remaining).await? else {
                break;
            };
            if line.trim() == MOTION_ACK {
                continue;
            }
            if let Some(distance) = parse_probe_line(&line) {
                let distance = distance?;
                info!(distance, "probe ok");
                return Ok(distance);
            }
            debug!(line = %line, "ignoring line while probing");
        }

        Err(ControllerError::ProbeTimeout {
            timeout_ms: PROBE_TIMEOUT.as_millis() as u64,
        })
    }

    async fn get_position(&self) -> ControllerResult<Position> {
        let mut link = self.link.lock().await;
        let device = link.ensure_connected().await?;
        device.drain();
        device.write_line("?").await?;

        let deadline = Instant::now() + POSITION_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(line) = device.read_line(remaining).await? else {
                break;
            };
            if let Some(position) = parse_status_line(&line) {
                return Ok(position);
            }
        }

        Err(ControllerError::PositionTimeout {
            timeout_ms: POSITION_WINDOW.as_millis() as u64,
        })
    }

    async fn disconnect(&self) {
        self.link.lock().await.disconnect().await;
    }
}
