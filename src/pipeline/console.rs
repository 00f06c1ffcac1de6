//! Operator console
//!
//! Line-oriented commands read from stdin while the controller runs.

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::worker::OperatorHandle;
use crate::config::{defaults, ControlConfig};
use crate::types::{Direction, PumpConfigDraft};

pub const HELP: &str = "\
Commands:
  mark                          set elapsed-time zero to now
  enable | disable              switch automatic control on or off
  status [json]                 show controller state
  ports                         list serial ports
  connect <pump> [port]         open a pump (port defaults to its configured one)
  disconnect <pump>             release a pump
  configure <pump> key=value..  set port=, vpr=, rpm=, dir=cw|ccw
  designate <pump>              drive this pump from the PID loop
  calibrate <pump> [revs]       turn a fixed number of revolutions (default 5)
  reload                        re-read [pid] from the config file
  stop                          shut down
  help                          this text";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Mark,
    Enable,
    Disable,
    Status { json: bool },
    Ports,
    Connect { pump: String, port: Option<String> },
    Disconnect { pump: String },
    Configure { pump: String, draft: PumpConfigDraft },
    Designate { pump: String },
    Calibrate { pump: String, revolutions: f64 },
    Reload,
    Stop,
    Help,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();
        let pump = |usage: &str| -> Result<String, String> {
            args.first()
                .map(|p| (*p).to_string())
                .ok_or_else(|| format!("usage: {usage}"))
        };

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "mark" => Self::Mark,
            "enable" | "on" => Self::Enable,
            "disable" | "off" => Self::Disable,
            "status" => Self::Status {
                json: args.first().is_some_and(|a| a.eq_ignore_ascii_case("json")),
            },
            "ports" => Self::Ports,
            "connect" => Self::Connect {
                pump: pump("connect <pump> [port]")?,
                port: args.get(1).map(|p| (*p).to_string()),
            },
            "disconnect" => Self::Disconnect {
                pump: pump("disconnect <pump>")?,
            },
            "configure" => Self::Configure {
                pump: pump("configure <pump> key=value..")?,
                draft: parse_draft(args.get(1..).unwrap_or_default())?,
            },
            "designate" => Self::Designate {
                pump: pump("designate <pump>")?,
            },
            "calibrate" => Self::Calibrate {
                pump: pump("calibrate <pump> [revs]")?,
                revolutions: match args.get(1) {
                    Some(raw) => raw
                        .parse::<f64>()
                        .ok()
                        .filter(|r| r.is_finite() && *r > 0.0)
                        .ok_or_else(|| format!("revs: '{raw}' is not a positive number"))?,
                    None => defaults::CALIBRATION_REVOLUTIONS,
                },
            },
            "reload" => Self::Reload,
            "stop" | "quit" | "exit" => Self::Stop,
            "help" | "?" => Self::Help,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };
        Ok(Some(cmd))
    }
}

fn parse_draft(pairs: &[&str]) -> Result<PumpConfigDraft, String> {
    if pairs.is_empty() {
        return Err("configure needs at least one of port=, vpr=, rpm=, dir=".to_string());
    }
    let mut draft = PumpConfigDraft::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        let number = || {
            value
                .parse::<f64>()
                .map_err(|_| format!("{key}: '{value}' is not a number"))
        };
        match key {
            "port" => draft.port = Some(value.to_string()),
            "vpr" | "volume_per_rev" => draft.volume_per_rev = Some(number()?),
            "rpm" | "speed_rpm" => draft.speed_rpm = Some(number()?),
            "dir" | "direction" => {
                draft.direction = Some(match value.to_ascii_lowercase().as_str() {
                    "cw" | "clockwise" => Direction::Clockwise,
                    "ccw" | "counterclockwise" => Direction::CounterClockwise,
                    _ => return Err(format!("dir: expected cw or ccw, got '{value}'")),
                });
            }
            _ => return Err(format!("unknown pump setting '{key}'")),
        }
    }
    Ok(draft)
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mark => f.write_str("mark"),
            Self::Enable => f.write_str("enable"),
            Self::Disable => f.write_str("disable"),
            Self::Status { .. } => f.write_str("status"),
            Self::Ports => f.write_str("ports"),
            Self::Connect { pump, .. } => write!(f, "connect {pump}"),
            Self::Disconnect { pump } => write!(f, "disconnect {pump}"),
            Self::Configure { pump, .. } => write!(f, "configure {pump}"),
            Self::Designate { pump } => write!(f, "designate {pump}"),
            Self::Calibrate { pump, revolutions } => write!(f, "calibrate {pump} {revolutions}"),
            Self::Reload => f.write_str("reload"),
            Self::Stop => f.write_str("stop"),
            Self::Help => f.write_str("help"),
        }
    }
}

// ============================================================================
// Console Loop
// ============================================================================

pub struct Console {
    handle: OperatorHandle,
    config_path: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Console {
    pub fn new(handle: OperatorHandle, config_path: Option<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            handle,
            config_path,
            cancel,
        }
    }

    /// Read commands until `stop`, end of input, or cancellation.
    pub async fn run<R: AsyncBufRead + Unpin>(self, reader: R) -> Result<()> {
        let mut lines = reader.lines();
        println!("{HELP}");

        loop {
            let line = tokio::select! {
                () = self.cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!("Console input closed; controller keeps running");
                break;
            };

            match ConsoleCommand::parse(&line) {
                Ok(None) => {}
                Ok(Some(ConsoleCommand::Stop)) => {
                    info!("Stop requested from console");
                    self.cancel.cancel();
                    break;
                }
                Ok(Some(cmd)) => match self.execute(&cmd).await {
                    Ok(reply) => println!("{reply}"),
                    Err(e) => {
                        warn!(command = %cmd, error = %e, "Console command failed");
                        println!("error: {e:#}");
                    }
                },
                Err(msg) => println!("{msg}"),
            }
        }
        Ok(())
    }

    /// Run one command and return the text to show.
    pub async fn execute(&self, cmd: &ConsoleCommand) -> Result<String> {
        let h = &self.handle;
        Ok(match cmd {
            ConsoleCommand::Mark => {
                h.mark();
                "elapsed-time mark set".to_string()
            }
            ConsoleCommand::Enable => {
                h.set_enabled(true).await?;
                "automatic control enabled".to_string()
            }
            ConsoleCommand::Disable => {
                h.set_enabled(false).await?;
                "automatic control disabled".to_string()
            }
            ConsoleCommand::Status { json } => {
                let status = h.status().await?;
                if *json {
                    serde_json::to_string_pretty(&status)?
                } else {
                    status.to_string()
                }
            }
            ConsoleCommand::Ports => {
                let ports = h.list_ports().await?;
                if ports.is_empty() {
                    "no serial ports found".to_string()
                } else {
                    ports
                        .iter()
                        .map(|p| format!("{}  {}", p.name, p.description))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ConsoleCommand::Connect { pump, port } => {
                h.connect(pump, port.as_deref()).await?;
                format!("{pump} connected")
            }
            ConsoleCommand::Disconnect { pump } => {
                h.disconnect(pump).await?;
                format!("{pump} disconnected")
            }
            ConsoleCommand::Configure { pump, draft } => {
                h.configure(pump, draft.clone()).await?;
                format!("{pump} configuration updated")
            }
            ConsoleCommand::Designate { pump } => {
                h.designate(pump).await?;
                format!("{pump} is now driven by the PID loop")
            }
            ConsoleCommand::Calibrate { pump, revolutions } => {
                let receipt = h.calibrate(pump, *revolutions).await?;
                format!(
                    "{pump} turning {} rev ({:.3} mL at the configured volume per rev); \
                     measure the output and set vpr=<mL>/{}",
                    receipt.revolutions, receipt.volume, receipt.revolutions
                )
            }
            ConsoleCommand::Reload => {
                let path = self
                    .config_path
                    .as_deref()
                    .ok_or_else(|| anyhow!("running on built-in defaults, no config file to reload"))?;
                let config = ControlConfig::load_from_file(path)?;
                h.replace_pid(config.pid.to_pid_config()).await?;
                format!("PID configuration reloaded from {}", path.display())
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Stop => "stopping".to_string(),
        })
    }
}
