//! Controller configuration, state and decisions

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::TrackedValue;
use crate::config::defaults;

// ============================================================================
// PID Configuration
// ============================================================================

/// Tuning and safety limits for one PID loop.
///
/// Replaced as a whole between ticks, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    /// Target concentration for the tracked value
    pub setpoint: f64,
    /// Proportional gain
    pub kp: f64,
    /// Integral gain (per second)
    pub ki: f64,
    /// Derivative gain (seconds)
    pub kd: f64,
    /// Lowest dose per tick (mL), never negative
    pub output_min: f64,
    /// Highest dose per tick (mL)
    pub output_max: f64,
    /// Ceiling on total volume dispensed by one pump (mL)
    pub max_cumulative_volume: f64,
    /// Drive the proportional term from measurement changes instead of error
    pub proportional_on_measurement: bool,
    /// Prediction column the loop regulates
    pub tracked: TrackedValue,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            setpoint: defaults::PID_SETPOINT,
            kp: defaults::PID_KP,
            ki: defaults::PID_KI,
            kd: defaults::PID_KD,
            output_min: defaults::PID_OUTPUT_MIN,
            output_max: defaults::PID_OUTPUT_MAX,
            max_cumulative_volume: defaults::PID_MAX_CUMULATIVE_VOLUME,
            proportional_on_measurement: true,
            tracked: TrackedValue::default(),
        }
    }
}

impl PidConfig {
    /// Collect every problem with this configuration. Empty means valid.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("setpoint", self.setpoint),
            ("kp", self.kp),
            ("ki", self.ki),
            ("kd", self.kd),
            ("output_min", self.output_min),
            ("output_max", self.output_max),
            ("max_cumulative_volume", self.max_cumulative_volume),
        ] {
            if !value.is_finite() {
                errors.push(format!("pid.{name} must be a finite number (got {value})"));
            }
        }

        if self.output_min < 0.0 {
            errors.push(format!(
                "pid.output_min ({}) must be >= 0, a pump cannot withdraw volume",
                self.output_min
            ));
        }
        if self.output_min > self.output_max {
            errors.push(format!(
                "pid.output_min ({}) must be <= pid.output_max ({})",
                self.output_min, self.output_max
            ));
        }
        if self.max_cumulative_volume < 0.0 {
            errors.push(format!(
                "pid.max_cumulative_volume ({}) must be >= 0",
                self.max_cumulative_volume
            ));
        }
        if let TrackedValue::Label(label) = &self.tracked {
            if label.trim().is_empty() {
                errors.push("pid.tracked label must not be empty".to_string());
            }
        }

        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }
}

// ============================================================================
// PID State
// ============================================================================

/// Mutable controller memory. Owned by exactly one `PidController`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PidState {
    /// Accumulated integral term (output units)
    pub integral: f64,
    /// Accumulated proportional term, used in proportional-on-measurement mode
    pub proportional: f64,
    /// Measurement seen by the previous tick
    pub last_measurement: Option<f64>,
    /// Error seen by the previous tick
    pub last_error: Option<f64>,
    /// Total volume committed so far (mL)
    pub cumulative_dispensed: f64,
    /// Timestamp of the previous tick
    pub last_tick: Option<NaiveDateTime>,
}

impl PidState {
    /// Fresh state that carries forward volume already dispensed, e.g. after a restart.
    pub fn resumed(cumulative_dispensed: f64) -> Self {
        Self {
            cumulative_dispensed: cumulative_dispensed.max(0.0),
            ..Self::default()
        }
    }
}

// ============================================================================
// Dispense Decision
// ============================================================================

/// Result of one controller tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DispenseDecision {
    /// Timestamp of the record that triggered the tick
    pub timestamp: NaiveDateTime,
    /// Measurement fed into the controller
    pub measurement: f64,
    /// Unclamped P + I + D
    pub raw_output: f64,
    /// Output after rounding and clamping to the per-tick limits
    pub clamped_output: f64,
    /// Volume to dispense after the cumulative ceiling and pump metering (mL)
    pub output: f64,
    /// True when `output` was reduced solely to respect the cumulative ceiling
    pub cap_limited: bool,
    /// Cumulative volume including `output`
    pub cumulative_dispensed: f64,
    /// Whether the controller was enabled for this tick
    pub enabled: bool,
    /// Configuration snapshot the tick ran against
    pub config: Arc<PidConfig>,
}
