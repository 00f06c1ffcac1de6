//! Control State and Status Reporting
//!
//! The orchestrator's state machine and the read-only snapshot it hands to
//! operators.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::clock::Elapsed;
use crate::types::PumpConfig;

// ============================================================================
// Control State
// ============================================================================

/// Lifecycle of the designated pump's control loop.
///
/// ```text
/// Idle ──start──▶ Watching ──ready──▶ Active ──CommandError──▶ Faulted
///                    ▲                  │                        │
///                    └──pump lost───────┘◀───operator reconnect──┘
/// any ──stop──▶ Stopped
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControlState {
    /// Constructed, not yet accepting records
    Idle,
    /// Polling, but the header, pump or configuration is not ready
    Watching,
    /// Every new record runs one tick and one dispense
    Active,
    /// A pump command failed; records are audited but nothing is dispensed
    Faulted { error: String },
    /// Terminal
    Stopped,
}

impl ControlState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Watching => write!(f, "Watching"),
            Self::Active => write!(f, "Active"),
            Self::Faulted { error } => write!(f, "Faulted ({error})"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

// ============================================================================
// Status Snapshot
// ============================================================================

/// One configured pump as the operator sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpStatus {
    pub id: String,
    pub designated: bool,
    pub connected: bool,
    pub port: Option<String>,
    pub config: Option<PumpConfig>,
    /// Volume committed by this pump's controller (mL)
    pub cumulative_dispensed: f64,
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ControlState,
    pub enabled: bool,
    pub designated_pump: Option<String>,
    /// Resolved header label, once the header has been read
    pub tracked: Option<String>,
    pub elapsed: Elapsed,
    pub records_processed: u64,
    pub last_measurement: Option<f64>,
    pub last_output: Option<f64>,
    pub audit_path: PathBuf,
    pub pumps: Vec<PumpStatus>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:        {}", self.state)?;
        writeln!(
            f,
            "Control:      {}",
            if self.enabled { "enabled" } else { "disabled" }
        )?;
        writeln!(
            f,
            "Tracking:     {}",
            self.tracked.as_deref().unwrap_or("(header not read)")
        )?;
        writeln!(f, "Elapsed (h):  {}", self.elapsed)?;
        writeln!(f, "Records:      {}", self.records_processed)?;
        if let Some(m) = self.last_measurement {
            writeln!(f, "Last input:   {m}")?;
        }
        if let Some(o) = self.last_output {
            writeln!(f, "Last output:  {o} mL")?;
        }
        writeln!(f, "Audit log:    {}", self.audit_path.display())?;
        for pump in &self.pumps {
            writeln!(
                f,
                "Pump {}{}: {} ({} mL total){}",
                pump.id,
                if pump.designated { " [designated]" } else { "" },
                pump.port
                    .as_deref()
                    .filter(|_| pump.connected)
                    .unwrap_or("disconnected"),
                pump.cumulative_dispensed,
                if pump.config.is_some() { "" } else { ", unconfigured" },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulted_display_carries_error() {
        let state = ControlState::Faulted {
            error: "pump did not answer".to_string(),
        };
        assert_eq!(state.to_string(), "Faulted (pump did not answer)");
        assert!(state.is_faulted());
        assert!(!state.is_active());
    }

    #[test]
    fn state_serializes_tagged() {
        let json = serde_json::to_string(&ControlState::Active).unwrap();
        assert_eq!(json, r#"{"state":"active"}"#);
    }
}
