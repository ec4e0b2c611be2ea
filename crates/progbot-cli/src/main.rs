//! ProgBot - pick/probe/program fixture CLI
//!
//! The `progbot` command drives a panel through the fixture headless, and
//! doubles as a bench harness for provisioning scripts.
//!
//! ## Commands
//!
//! - `cycle`: run every board of a panel
//! - `retry`: re-run one board, then continue the sweep
//! - `provision`: run a provisioning script against one serial port
//! - `validate`: load a panel with the machine settings and report problems

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{info, warn, Level};

use progbot_core::config::PanelFile;
use progbot_core::provisioning::{ProvisionScript, VariableContext, Variables};
use progbot_core::{
    CommandCamera, Config, CycleSummary, DeviceConnector, ExportFormat, FileExportHandler,
    Hardware, HeadController, MotionController, NrfutilProgrammer, ProgBot, ProvisioningEngine,
    SerialConnector, Settings, TargetController, TracingObserver, VisionController,
};

#[derive(Parser)]
#[command(name = "progbot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pick/probe/program fixture controller", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Machine settings file (ports, offsets, tuning)
    #[arg(long, global = true, env = "PROGBOT_SETTINGS", default_value = "settings.json")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full cycle over a panel. Ctrl-C stops it safely.
    Cycle {
        /// Panel file
        #[arg(short, long)]
        panel: PathBuf,
    },

    /// Re-run one board from scratch, then continue with the boards after it
    Retry {
        /// Panel file
        #[arg(short, long)]
        panel: PathBuf,

        #[arg(long)]
        col: u32,

        #[arg(long)]
        row: u32,
    },

    /// Run a provisioning script over one serial port
    #[command(group(ArgGroup::new("source").required(true).args(["panel", "script"])))]
    Provision {
        /// Serial port of the target console
        #[arg(long)]
        port: String,

        #[arg(long, default_value = "115200")]
        baud: u32,

        /// Take the script and custom variables from a panel file
        #[arg(long)]
        panel: Option<PathBuf>,

        /// Standalone script file (JSON)
        #[arg(long)]
        script: Option<PathBuf>,

        /// Value for `{serial_number}` and `{qr_raw}`
        #[arg(long)]
        serial: Option<String>,

        #[arg(long, default_value = "0")]
        row: u32,

        #[arg(long, default_value = "0")]
        col: u32,

        /// Print the commands that would be sent, without opening the port
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a panel file and its provisioning script
    Validate {
        /// Panel file
        #[arg(short, long)]
        panel: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    progbot_core::telemetry::init_tracing(cli.json, level);

    let settings = Settings::load(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;

    match cli.command {
        Commands::Cycle { panel } => cmd_cycle(&settings, &panel, None).await,
        Commands::Retry { panel, col, row } => {
            cmd_cycle(&settings, &panel, Some((col, row))).await
        }
        Commands::Provision {
            port,
            baud,
            panel,
            script,
            serial,
            row,
            col,
            dry_run,
        } => {
            let (script, custom, panel_name) = match (panel, script) {
                (Some(panel), _) => script_from_panel(&panel)?,
                (None, Some(script)) => script_from_file(&script)?,
                (None, None) => bail!("Either --panel or --script is required"),
            };
            let ctx = board_context(row, col, &panel_name, serial, custom);
            if dry_run {
                for line in dry_run_lines(&script, &ctx) {
                    println!("{line}");
                }
                Ok(())
            } else {
                cmd_provision(&port, baud, &script, ctx).await
            }
        }
        Commands::Validate { panel } => cmd_validate(&settings, &panel),
    }
}

// ---------------------------------------------------------------------------
// cycle / retry
// ---------------------------------------------------------------------------

fn load_config(settings: &Settings, panel: &Path) -> Result<Config> {
    let panel_file = PanelFile::load(panel)
        .with_context(|| format!("Failed to load panel {}", panel.display()))?;
    Config::from_sources(settings, &panel_file).context("Invalid panel configuration")
}

/// Serial-backed controllers for every device named in `config`.
fn build_hardware(settings: &Settings, config: &Config) -> Result<Hardware> {
    let connector = |port: &str, baud: u32| Arc::new(SerialConnector::new(port, baud));

    let timeout_secs = settings.get_f64("programmer_timeout")?;
    let programmer = NrfutilProgrammer::new(
        config.network_core_firmware.clone(),
        config.main_core_firmware.clone(),
    )
    .with_executable(settings.get_str("programmer")?)
    .with_command_timeout(
        Duration::try_from_secs_f64(timeout_secs)
            .with_context(|| format!("Invalid programmer_timeout {timeout_secs}"))?,
    );

    Ok(Hardware {
        motion: Arc::new(MotionController::new(connector(
            &config.motion_port,
            config.motion_baud,
        ))),
        head: Arc::new(HeadController::new(connector(
            &config.head_port,
            config.head_baud,
        ))),
        target: Arc::new(TargetController::new(connector(
            &config.target_port,
            config.target_baud,
        ))),
        programmer: Arc::new(programmer),
        vision: build_vision(settings, config)?,
    })
}

fn build_vision(settings: &Settings, config: &Config) -> Result<Option<Arc<VisionController>>> {
    if !config.vision_enabled {
        return Ok(None);
    }
    let capture = settings.get_command("camera_capture_command")?;
    let decode = settings.get_command("camera_decode_command")?;
    if capture.is_empty() || decode.is_empty() {
        warn!("panel uses the camera but no camera commands are configured, QR scan disabled");
        return Ok(None);
    }

    let mut camera = CommandCamera::new(capture, decode);
    let micro = settings.get_command("camera_micro_decode_command")?;
    if !micro.is_empty() {
        camera = camera.with_micro_decoder(micro);
    }
    Ok(Some(Arc::new(VisionController::new(
        Arc::new(camera),
        config.scan_settings(),
    ))))
}

async fn cmd_cycle(settings: &Settings, panel: &Path, retry: Option<(u32, u32)>) -> Result<()> {
    let config = load_config(settings, panel)?;
    let hardware = build_hardware(settings, &config)?;
    info!(
        panel = %config.panel_name,
        mode = %config.operation_mode,
        boards = config.board_count(),
        "starting"
    );

    let mut bot = ProgBot::new(config, hardware);
    bot.subscribe(Arc::new(TracingObserver));

    let export_dir = settings.get_str("export_dir")?;
    if !export_dir.is_empty() {
        let format: ExportFormat = settings
            .get_str("export_format")?
            .parse()
            .context("Invalid export_format")?;
        bot.add_result_handler(Arc::new(FileExportHandler::new(export_dir, format)));
    }

    let cancel = bot.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after cleanup");
            cancel.cancel();
        }
    });

    let result = match retry {
        Some((col, row)) => bot.retry_board(col, row).await,
        None => bot.full_cycle().await,
    };
    bot.disconnect().await;

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => {
            if let Some(summary) = bot.last_summary() {
                print_summary(summary);
            }
            Err(e).context("Cycle did not complete")
        }
    }
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "{}: {} passed, {} failed, {} skipped ({:.1}% yield) in {:.1}s",
        summary.panel_name,
        summary.passed_count,
        summary.failed_count,
        summary.skipped_count,
        summary.yield_percent(),
        summary.duration_seconds,
    );
    for board in summary.failed_boards() {
        println!(
            "  [{}, {}] {}: {}",
            board.position.0,
            board.position.1,
            board.failure_phase.as_deref().unwrap_or("?"),
            board.failure_reason.as_deref().unwrap_or("failed"),
        );
    }
}

// ---------------------------------------------------------------------------
// provision
// ---------------------------------------------------------------------------

fn script_from_panel(path: &Path) -> Result<(ProvisionScript, Variables, String)> {
    let panel = PanelFile::load(path)
        .with_context(|| format!("Failed to load panel {}", path.display()))?;
    let Some(script) = panel.provision.script.clone() else {
        bail!("Panel {} has no provisioning script", path.display());
    };
    Ok((
        script,
        panel.provision.custom_variables.clone(),
        panel.display_name().to_string(),
    ))
}

fn script_from_file(path: &Path) -> Result<(ProvisionScript, Variables, String)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    let script = ProvisionScript::from_json(&text)
        .with_context(|| format!("Failed to parse script {}", path.display()))?;
    Ok((script, Variables::new(), "bench".to_string()))
}

fn board_context(
    row: u32,
    col: u32,
    panel_name: &str,
    serial: Option<String>,
    custom: Variables,
) -> VariableContext {
    let mut vision = Variables::new();
    if let Some(serial) = serial {
        vision.insert("qr_raw".into(), serial.clone());
        vision.insert("serial_number".into(), serial);
    }
    VariableContext::new(row, col, panel_name, vision, custom)
}

/// Each step as it would go out. Variables captured at run time show up
/// as unresolved.
fn dry_run_lines(script: &ProvisionScript, ctx: &VariableContext) -> Vec<String> {
    (0..script.steps.len())
        .filter_map(|i| script.resolve(i))
        .map(|step| {
            let send = match &step.send {
                Some(template) => {
                    let (text, missing) = ctx.substitute(template);
                    if missing.is_empty() {
                        format!("send {text:?}")
                    } else {
                        format!("send {text:?} (unresolved: {})", missing.join(", "))
                    }
                }
                None => "wait".to_string(),
            };
            match step.expect.as_ref().or(step.expect_any.as_ref().and_then(|p| p.first())) {
                Some(pattern) => format!("{}: {send}, expect /{pattern}/", step.label),
                None => format!("{}: {send}", step.label),
            }
        })
        .collect()
}

async fn cmd_provision(
    port: &str,
    baud: u32,
    script: &ProvisionScript,
    mut ctx: VariableContext,
) -> Result<()> {
    let issues = script.validate(&ctx.get_all());
    for issue in &issues {
        warn!(%issue, "script issue");
    }
    if issues.iter().any(|i| i.is_fatal()) {
        bail!("Script {} has invalid patterns", script.name);
    }

    let mut device = SerialConnector::new(port, baud)
        .open()
        .await
        .with_context(|| format!("Failed to open {port}"))?;
    let result = ProvisioningEngine::new()
        .execute(script, device.as_mut(), &mut ctx)
        .await;
    device.close().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!(
            "Provisioning failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn cmd_validate(settings: &Settings, panel: &Path) -> Result<()> {
    let config = load_config(settings, panel)?;
    println!(
        "{}: {}x{} boards, mode {}, {} skipped",
        config.panel_name,
        config.board_num_cols,
        config.board_num_rows,
        config.operation_mode,
        config.skip_board_pos.len(),
    );

    let Some(script) = &config.provision_script else {
        return Ok(());
    };
    let ctx = board_context(
        0,
        0,
        &config.panel_name,
        Some(String::new()),
        config.custom_variables.clone(),
    );
    let available = ctx.get_all();

    let issues = script.validate(&available);
    for issue in &issues {
        println!("  {issue}");
    }
    if issues.iter().any(|i| i.is_fatal()) {
        bail!("Provisioning script {} is invalid", script.name);
    }
    println!(
        "script {}: {} steps, {} warnings",
        script.name,
        script.steps.len(),
        issues.len()
    );
    Ok(())
}
