//! raman-pid: closed-loop feed control from Raman predictions
//!
//! ```text
//! raman-pid run [--config raman_pid.toml] [--simulate]
//! raman-pid ports
//! raman-pid reformat <FILES>... [--out DIR] [--format two-column|instep]
//! raman-pid check-config [PATH]
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use raman_pid::acquisition::{
    PredictionStream, RawSpectrumWatcher, SpectrumOutputFormat, SpectrumReformatter,
};
use raman_pid::clock::ElapsedTimeClock;
use raman_pid::config::{defaults, ConfigEvent, ConfigWatcher, ControlConfig, PumpEntry};
use raman_pid::control::PidConfigStore;
use raman_pid::pipeline::{
    Console, ControlOrchestrator, OperatorHandle, OrchestratorSettings, PredictionPoller,
    PumpWorker, SpectrumPoller,
};
use raman_pid::pump::{BlendedPump, LinkOpener, PumpChannel, SerialPortOpener, SerialPumpChannel, SimulatedPump};
use raman_pid::storage::{AuditLog, ProcessLock};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "raman-pid")]
#[command(about = "Closed-loop PID feed control from Raman chemometric predictions")]
#[command(version)]
struct CliArgs {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Defaults to `run` with no options
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller
    Run {
        /// Config file (otherwise $RAMAN_PID_CONFIG, then ./raman_pid.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Drive in-memory pumps instead of serial hardware
        #[arg(long)]
        simulate: bool,

        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,
    },

    /// List serial ports a pump could be attached to
    Ports,

    /// Reformat raw spectrum exports once and exit
    Reformat {
        /// Raw spectrometer exports
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory (default: paths.reformatted_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Output layout (default: reformatter.format)
        #[arg(short, long, value_enum)]
        format: Option<SpectrumOutputFormat>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a config file and print the effective configuration
    CheckConfig {
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    PumpWorker,
    PredictionPoller,
    SpectrumPoller,
    ConfigWatcher,
    ConfigApplier,
    Console,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PumpWorker => write!(f, "PumpWorker"),
            Self::PredictionPoller => write!(f, "PredictionPoller"),
            Self::SpectrumPoller => write!(f, "SpectrumPoller"),
            Self::ConfigWatcher => write!(f, "ConfigWatcher"),
            Self::ConfigApplier => write!(f, "ConfigApplier"),
            Self::Console => write!(f, "Console"),
        }
    }
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let command = args.command.unwrap_or(Command::Run {
        config: None,
        simulate: false,
        no_console: false,
    });
    let result = runtime.block_on(dispatch(command));
    // Stdin reads sit on a blocking thread that never returns by itself
    runtime.shutdown_timeout(Duration::from_millis(defaults::SHUTDOWN_GRACE_MS));
    result
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("raman_pid=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run {
            config,
            simulate,
            no_console,
        } => run_controller(config.as_deref(), simulate, !no_console).await,
        Command::Ports => list_ports(),
        Command::Reformat {
            files,
            out,
            format,
            config,
        } => reformat_files(&files, out, format, config.as_deref()),
        Command::CheckConfig { path } => check_config(path.as_deref()),
    }
}

// ============================================================================
// One-shot Commands
// ============================================================================

fn list_ports() -> Result<()> {
    let ports = SerialPortOpener::default()
        .list_ports()
        .context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}

fn reformat_files(
    files: &[PathBuf],
    out: Option<PathBuf>,
    format: Option<SpectrumOutputFormat>,
    config_path: Option<&Path>,
) -> Result<()> {
    let (config, _) = ControlConfig::load(config_path)?;
    let reformatter = SpectrumReformatter::new(
        out.unwrap_or(config.paths.reformatted_dir),
        config.reformatter.layout(),
        format.unwrap_or(config.reformatter.format),
    );

    let mut failed = 0usize;
    for file in files {
        match reformatter.reformat(file) {
            Ok(target) => println!("{} -> {}", file.display(), target.display()),
            Err(e) => {
                error!(path = %file.display(), error = %e, "Reformat failed");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} files could not be reformatted", files.len());
    }
    Ok(())
}

fn check_config(path: Option<&Path>) -> Result<()> {
    let (config, source) = ControlConfig::load(path)?;
    match source {
        Some(p) => println!("# {} is valid", p.display()),
        None => println!("# no config file found, built-in defaults"),
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

// ============================================================================
// Controller
// ============================================================================

async fn run_controller(config_path: Option<&Path>, simulate: bool, console: bool) -> Result<()> {
    let (config, config_path) = ControlConfig::load(config_path)?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  raman-pid feed controller");
    info!(
        "  setpoint {} | tracked {} | max volume {} mL",
        config.pid.setpoint, config.pid.tracked, config.pid.max_cumulative_volume
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let _process_lock = ProcessLock::acquire(&config.paths.data_dir)
        .context("Failed to acquire process lock")?;

    let store = Arc::new(PidConfigStore::new(config.pid.to_pid_config())?);
    let clock = Arc::new(ElapsedTimeClock::new());
    let audit = AuditLog::open(
        &config.paths.data_dir,
        &config.audit.file_name,
        config.audit.mode,
        Local::now().naive_local(),
    )?;

    let settings = OrchestratorSettings {
        smoothing_window: config.pid.smoothing_window,
        dispense_timeout: config.pump_link.dispense_timeout(),
        start_enabled: config.pid.start_enabled,
    };
    let mut orchestrator = ControlOrchestrator::new(store, clock.clone(), audit, settings);
    install_pumps(&mut orchestrator, &config, simulate).await?;

    let cancel = CancellationToken::new();
    let (worker, handle) = PumpWorker::new(
        orchestrator,
        clock,
        defaults::WORKER_CHANNEL_CAPACITY,
        cancel.clone(),
    );

    let mut tasks: JoinSet<Result<TaskName>> = JoinSet::new();
    tasks.spawn(async move {
        worker.run().await;
        Ok(TaskName::PumpWorker)
    });

    let poller = PredictionPoller::new(
        PredictionStream::new(&config.paths.prediction_file)
            .skip_backlog(!config.polling.replay_backlog),
        handle.clone(),
        Duration::from_millis(config.polling.prediction_interval_ms),
    );
    let token = cancel.clone();
    tasks.spawn(async move {
        poller.run(token).await;
        Ok(TaskName::PredictionPoller)
    });

    let spectra = SpectrumPoller::new(
        RawSpectrumWatcher::new(
            &config.paths.raw_spectra_dir,
            config.polling.settle_polls,
            config.reformatter.process_existing,
        ),
        SpectrumReformatter::new(
            &config.paths.reformatted_dir,
            config.reformatter.layout(),
            config.reformatter.format,
        ),
        Duration::from_millis(config.polling.spectra_interval_ms),
    );
    let token = cancel.clone();
    tasks.spawn(async move {
        spectra.run(token).await;
        Ok(TaskName::SpectrumPoller)
    });

    if let Some(path) = &config_path {
        let (tx, rx) = mpsc::channel(4);
        let watcher = ConfigWatcher::new(
            path.clone(),
            Duration::from_secs(config.polling.config_watch_interval_secs),
            config.clone(),
        );
        let token = cancel.clone();
        tasks.spawn(async move {
            watcher.run(tx, token).await;
            Ok(TaskName::ConfigWatcher)
        });
        let applier = handle.clone();
        tasks.spawn(async move {
            apply_config_events(rx, applier).await;
            Ok(TaskName::ConfigApplier)
        });
    }

    if console {
        let console = Console::new(handle.clone(), config_path.clone(), cancel.clone());
        tasks.spawn(async move {
            console.run(tokio::io::BufReader::new(tokio::io::stdin())).await?;
            Ok(TaskName::Console)
        });
    }
    drop(handle);

    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let result = run_supervisor(&mut tasks, cancel.clone()).await;
    cancel.cancel();
    drain(&mut tasks, config.shutdown_grace()).await;

    info!("✓ raman-pid shutdown complete");
    result
}

/// Register every configured pump and blend, apply pump settings and open
/// the ones marked `auto_connect`. Blend members are only reachable through
/// their blend.
async fn install_pumps(
    orchestrator: &mut ControlOrchestrator,
    config: &ControlConfig,
    simulate: bool,
) -> Result<()> {
    let mut entries = config.pumps.clone();
    if simulate && entries.is_empty() {
        entries.push(PumpEntry {
            id: "sim".to_string(),
            ..PumpEntry::default()
        });
    }
    if entries.is_empty() {
        warn!("No [[pumps]] configured; control stays in Watching");
    }

    let mut channels: HashMap<String, Box<dyn PumpChannel>> = HashMap::new();
    for (i, entry) in entries.iter_mut().enumerate() {
        let mut channel: Box<dyn PumpChannel> = if simulate {
            let port = entry.port.get_or_insert_with(|| format!("SIM{i}")).clone();
            let (pump, _) = SimulatedPump::new(&entry.id, &[port.as_str()]);
            Box::new(pump)
        } else {
            let link = &config.pump_link;
            Box::new(
                SerialPumpChannel::new(&entry.id, entry.address, SerialPortOpener::new(link.baud_rate))?
                    .with_command_timeout(link.command_timeout())
                    .with_reply_idle(link.reply_idle()),
            )
        };
        if let Err(e) = channel.configure(&entry.draft()) {
            warn!(pump = %entry.id, error = %e, "Pump left unconfigured");
        }
        channels.insert(entry.id.clone(), channel);
    }

    let mut blends = Vec::new();
    for blend in &config.blends {
        let mut member = |id: &str| {
            channels
                .remove(id)
                .with_context(|| format!("blend '{}' member '{id}' is not available", blend.id))
        };
        let first = member(&blend.first)?;
        let second = member(&blend.second)?;
        blends.push(BlendedPump::new(&blend.id, first, second, blend.ratio)?);
    }
    for entry in &entries {
        if let Some(channel) = channels.remove(&entry.id) {
            orchestrator.add_pump(channel)?;
        }
    }
    for blend in blends {
        info!(pump = blend.id(), members = ?blend.members(), ratio = blend.ratio(), "Blend registered");
        orchestrator.add_pump(Box::new(blend))?;
    }

    if let Some(id) = &config.designated_pump {
        orchestrator.designate(id)?;
    }

    let connectable = |id: &str| {
        entries
            .iter()
            .any(|e| e.id == id && e.auto_connect && e.port.is_some())
    };
    let standalone = entries
        .iter()
        .map(|e| e.id.as_str())
        .filter(|id| !config.blends.iter().any(|b| b.first == *id || b.second == *id));
    let blended = config
        .blends
        .iter()
        .filter(|b| connectable(&b.first) && connectable(&b.second))
        .map(|b| b.id.as_str());
    let targets: Vec<&str> = standalone.filter(|id| connectable(id)).chain(blended).collect();
    for id in targets {
        match orchestrator.connect(id, None).await {
            Ok(()) => info!(pump = %id, "Pump connected"),
            Err(e) => warn!(pump = %id, error = %e, "Auto-connect failed; use 'connect' from the console"),
        }
    }
    Ok(())
}

/// Push hot-reloaded `[pid]` sections to the worker.
async fn apply_config_events(mut rx: mpsc::Receiver<ConfigEvent>, handle: OperatorHandle) {
    while let Some(event) = rx.recv().await {
        match event {
            ConfigEvent::Reloaded {
                pid,
                restart_required,
            } => {
                if let Some(pid) = pid {
                    match handle.replace_pid(pid.to_pid_config()).await {
                        Ok(()) => info!("PID configuration hot-reloaded"),
                        Err(e) => warn!(error = %e, "Hot-reloaded PID configuration rejected"),
                    }
                }
                if !restart_required.is_empty() {
                    warn!(
                        sections = ?restart_required,
                        "Config sections changed that only apply after a restart"
                    );
                }
            }
            ConfigEvent::Error(e) => warn!(error = %e, "Config file change ignored"),
        }
    }
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {:#}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {e}"));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Wait for tasks to wind down; abort whatever is still running after the grace period.
async fn drain(task_set: &mut JoinSet<Result<TaskName>>, grace: Duration) {
    let finished = tokio::time::timeout(grace, async {
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(name)) => info!("Task {} stopped", name),
                Ok(Err(e)) => warn!("Task ended with error during shutdown: {:#}", e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Task panicked during shutdown: {}", e),
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!(remaining = task_set.len(), "Shutdown grace period elapsed, aborting tasks");
        task_set.abort_all();
    }
}
