//! Subprocess execution with a deadline.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// The command line, for logs.
    pub command: String,

    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: Vec<u8>,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl CommandOutput {
    /// Whether the command exited 0.
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Stdout as trimmed text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run `argv[0]` with the remaining arguments, killing it after `timeout`.
pub async fn run_command(argv: &[String], timeout: Duration) -> io::Result<CommandOutput> {
    let start = Instant::now();

    let Some((exe, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let command = argv.join(" ");
    debug!(command = %command, "running command");

    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("`{command}` timed out after {}s", timeout.as_secs_f64()),
            )
        })??;

    let result = CommandOutput {
        command,
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        success: output.status.success(),
    };
    debug!(
        command = %result.command,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "command finished"
    );
    Ok(result)
}
