//! Flashing through `nrfutil` for dual-core nRF53 targets.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::error::ControllerResult;
use super::{PhaseSink, Programmer};
use crate::process::run_command;

/// Default per-command limit. Recovering a locked part takes a while.
pub const DEFAULT_PROGRAMMER_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs `nrfutil device ...` subcommands.
#[derive(Debug, Clone)]
pub struct NrfutilProgrammer {
    executable: String,
    network_core_firmware: PathBuf,
    main_core_firmware: PathBuf,
    command_timeout: Duration,
}

impl NrfutilProgrammer {
    pub fn new(network_core_firmware: impl Into<PathBuf>, main_core_firmware: impl Into<PathBuf>) -> Self {
        Self {
            executable: "nrfutil".to_string(),
            network_core_firmware: network_core_firmware.into(),
            main_core_firmware: main_core_firmware.into(),
            command_timeout: DEFAULT_PROGRAMMER_TIMEOUT,
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The programming sequence as (phase label, `nrfutil device` args).
    pub fn program_steps(&self) -> Vec<(&'static str, Vec<String>)> {
        let net = self.network_core_firmware.display().to_string();
        let main = self.main_core_firmware.display().to_string();
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        vec![
            ("Recover main core", args(&["recover"])),
            ("Recover network core", args(&["recover", "--core", "Network"])),
            ("Erase main core", args(&["erase"])),
            ("Erase network core", args(&["erase", "--core", "Network"])),
            (
                "Flash network core image",
                args(&["program", "--firmware", &net, "--core", "Network"]),
            ),
            ("Flash main image", args(&["program", "--firmware", &main])),
            ("Reset target", args(&["reset"])),
        ]
    }

    /// Run one `nrfutil device` subcommand. Launch failures count as a
    /// failed step, not an error, so the board is marked failed and the
    /// cycle moves on.
    async fn device_command(&self, args: &[String]) -> bool {
        let mut argv = vec![self.executable.clone(), "device".to_string()];
        argv.extend_from_slice(args);

        match run_command(&argv, self.command_timeout).await {
            Ok(out) if out.passed() => true,
            Ok(out) => {
                warn!(
                    command = %out.command,
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "programmer command failed"
                );
                false
            }
            Err(e) => {
                error!(command = %argv.join(" "), error = %e, "could not run programmer");
                false
            }
        }
    }
}

#[async_trait]
impl Programmer for NrfutilProgrammer {
    async fn identify(&self, phases: &dyn PhaseSink) -> ControllerResult<bool> {
        phases.phase("Identify");
        Ok(self.device_command(&["device-info".to_string()]).await)
    }

    async fn program(&self, phases: &dyn PhaseSink) -> ControllerResult<bool> {
        for (label, args) in self.program_steps() {
            phases.phase(label);
            if !self.device_command(&args).await {
                warn!(step = label, "programming aborted");
                return Ok(false);
            }
        }
        info!("programming complete");
        Ok(true)
    }
}
