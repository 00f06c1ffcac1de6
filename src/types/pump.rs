//! Pump configuration types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rotation direction of a peristaltic pump head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "cw")]
    Clockwise,
    #[serde(alias = "ccw")]
    CounterClockwise,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clockwise => f.write_str("CW"),
            Self::CounterClockwise => f.write_str("CCW"),
        }
    }
}

/// Fully populated pump settings. Required before any dispense is accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpConfig {
    /// Serial port the pump is reached through
    pub port: String,
    /// mL delivered per head revolution
    pub volume_per_rev: f64,
    /// Run speed in rpm
    pub speed_rpm: f64,
    pub direction: Direction,
}

impl PumpConfig {
    /// Revolutions needed to deliver `volume` mL.
    pub fn volume_to_revolutions(&self, volume: f64) -> f64 {
        volume / self.volume_per_rev
    }
}

/// Pump settings as entered by an operator or read from config, possibly partial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpConfigDraft {
    pub port: Option<String>,
    pub volume_per_rev: Option<f64>,
    pub speed_rpm: Option<f64>,
    pub direction: Option<Direction>,
}

impl PumpConfigDraft {
    /// Promote to a complete config, or name every missing field.
    pub fn complete(&self) -> Result<PumpConfig, Vec<&'static str>> {
        let mut missing = Vec::new();
        if self.port.as_deref().map_or(true, |p| p.trim().is_empty()) {
            missing.push("port");
        }
        if self.volume_per_rev.is_none() {
            missing.push("volume_per_rev");
        }
        if self.speed_rpm.is_none() {
            missing.push("speed_rpm");
        }
        if self.direction.is_none() {
            missing.push("direction");
        }

        match (&self.port, self.volume_per_rev, self.speed_rpm, self.direction) {
            (Some(port), Some(volume_per_rev), Some(speed_rpm), Some(direction))
                if missing.is_empty() =>
            {
                Ok(PumpConfig {
                    port: port.clone(),
                    volume_per_rev,
                    speed_rpm,
                    direction,
                })
            }
            _ => Err(missing),
        }
    }
}
