//! Pump actuation
//!
//! Everything the control loop knows about a pump goes through the
//! [`PumpChannel`] trait: list ports, connect, configure, dispense and
//! disconnect. A [`BlendedPump`] splits one dose across two drives. Vendor framing lives in [`protocol`] and is only used by the
//! serial implementation, so another pump family can be added without
//! touching the orchestrator.

pub mod blend;
pub mod protocol;
pub mod serial;
pub mod simulated;

pub use blend::BlendedPump;
pub use protocol::{ControlMode, DeviceStatus, MotorStatus, PumpFault};
pub use serial::{LinkOpener, SerialPortOpener, SerialPumpChannel};
pub use simulated::{SimulatedPump, SimulatedPumpHandle};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::{PumpConfig, PumpConfigDraft};

// ============================================================================
// Errors
// ============================================================================

/// Opening or identifying a pump failed. Previous connection state is kept.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot connect to pump on {port}: {reason}")]
pub struct ConnectionError {
    pub port: String,
    pub reason: String,
}

/// A pump configuration was refused.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PumpConfigError {
    #[error("pump configuration incomplete, missing: {}", .missing.join(", "))]
    ConfigIncomplete { missing: Vec<&'static str> },

    #[error("invalid pump configuration: {0}")]
    InvalidConfig(String),
}

/// A command sent to a connected pump failed. No physical dispense can be assumed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("pump did not answer '{command}' within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("pump rejected '{command}' (NAK)")]
    Nack { command: String },

    #[error("pump replied {reply:?} to '{command}'")]
    UnexpectedReply { command: String, reply: String },

    #[error("serial write failed: {0}")]
    Io(String),

    #[error("pump is not connected")]
    NotConnected,

    #[error("pump is not configured")]
    NotConfigured,

    #[error("dispense of {0} mL rejected")]
    InvalidVolume(String),

    #[error("{volume} mL is below the smallest step the pump can meter")]
    BelowResolution { volume: String },

    #[error("{0}")]
    Unsupported(String),
}

/// Any pump-boundary failure, for callers that do not care which operation failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PumpError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] PumpConfigError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no pump named '{0}'")]
    UnknownPump(String),

    #[error("port enumeration failed: {0}")]
    Enumeration(String),
}

// ============================================================================
// Channel Contract
// ============================================================================

/// A serial endpoint a pump might be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// What a successful dispense actually commanded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispenseReceipt {
    /// Volume represented by the commanded revolutions (mL)
    pub volume: f64,
    pub revolutions: f64,
}

/// One physical pump. The orchestrator decides which channel is the PID target.
#[async_trait]
pub trait PumpChannel: Send {
    /// Stable name used by operators and in the audit log.
    fn id(&self) -> &str;

    /// Enumerate candidate ports without touching any device.
    fn list_ports(&self) -> Result<Vec<PortInfo>, PumpError>;

    /// Open `port` and identify the pump. On failure the previous
    /// connection, if any, is left as it was.
    async fn connect(&mut self, port: &str) -> Result<(), ConnectionError>;

    /// Accept a complete configuration. Partial drafts are refused.
    fn configure(&mut self, draft: &PumpConfigDraft) -> Result<(), PumpConfigError>;

    /// Connect on the port held in the current configuration.
    async fn connect_configured(&mut self) -> Result<(), PumpError> {
        let port = self
            .config()
            .map(|c| c.port.clone())
            .ok_or(PumpConfigError::ConfigIncomplete {
                missing: vec!["port"],
            })?;
        self.connect(&port).await.map_err(Into::into)
    }

    /// Deliver `volume` mL using the configured speed and direction.
    async fn dispense(&mut self, volume: f64) -> Result<DispenseReceipt, CommandError>;

    /// Largest volume not above `volume` that [`dispense`](Self::dispense)
    /// can deliver exactly. Zero when unconfigured.
    fn deliverable(&self, volume: f64) -> f64 {
        self.config()
            .map_or(0.0, |config| deliverable_volume(config, volume))
    }

    /// Turn the head a fixed number of revolutions, for measuring the
    /// real volume per revolution.
    async fn run_revolutions(&mut self, revolutions: f64) -> Result<DispenseReceipt, CommandError>;

    /// Query the device's own status word.
    async fn status(&mut self) -> Result<DeviceStatus, CommandError>;

    /// Close the connection. Safe to call when already disconnected.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn config(&self) -> Option<&PumpConfig>;

    /// Port of the live connection.
    fn port(&self) -> Option<&str>;

    /// True once connected and configured.
    fn is_ready(&self) -> bool {
        self.is_connected() && self.config().is_some()
    }
}

/// `volume` truncated to whole 0.01-revolution steps of `config`.
pub fn deliverable_volume(config: &PumpConfig, volume: f64) -> f64 {
    if !(volume.is_finite() && volume > 0.0) {
        return 0.0;
    }
    let revolutions = protocol::floor_revolutions(config.volume_to_revolutions(volume));
    (revolutions * config.volume_per_rev).min(volume)
}

/// Check a draft for completeness and device limits.
pub fn validate_draft(draft: &PumpConfigDraft) -> Result<PumpConfig, PumpConfigError> {
    let config = draft
        .complete()
        .map_err(|missing| PumpConfigError::ConfigIncomplete { missing })?;

    if !(config.volume_per_rev.is_finite() && config.volume_per_rev > 0.0) {
        return Err(PumpConfigError::InvalidConfig(format!(
            "volume_per_rev must be > 0 (got {})",
            config.volume_per_rev
        )));
    }
    protocol::validate_rpm(config.speed_rpm).map_err(PumpConfigError::InvalidConfig)?;
    Ok(config)
}
