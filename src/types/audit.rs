//! Audit trail types

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Timestamp layout used in the audit log.
pub const AUDIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Dispense Outcome
// ============================================================================

/// Why a record produced no pump command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Tracked identifier not yet resolved against the header
    NotReady,
    /// Designated pump missing, disconnected or unconfigured
    PumpNotReady,
    /// Dispensing halted after a pump failure
    Faulted,
    /// Automatic control switched off by the operator
    Disabled,
    /// Controller output was zero
    NothingToDispense,
    /// Tracked value was missing or not a finite number
    InvalidMeasurement,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => f.write_str("not ready"),
            Self::PumpNotReady => f.write_str("pump not ready"),
            Self::Faulted => f.write_str("faulted"),
            Self::Disabled => f.write_str("disabled"),
            Self::NothingToDispense => f.write_str("nothing to dispense"),
            Self::InvalidMeasurement => f.write_str("invalid measurement"),
        }
    }
}

/// What happened at the pump for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DispenseOutcome {
    /// Command acknowledged by the pump
    Dispensed,
    /// Command attempted and failed; no physical dispense can be assumed
    Failed(String),
    /// No command was sent
    Skipped(SkipReason),
}

impl DispenseOutcome {
    pub fn is_dispensed(&self) -> bool {
        matches!(self, Self::Dispensed)
    }
}

impl fmt::Display for DispenseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispensed => f.write_str("dispensed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

// ============================================================================
// Audit Log Entry
// ============================================================================

/// One line of the audit log. Written exactly once per processed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    pub timestamp: NaiveDateTime,
    /// Hours since the operator mark, `None` when unmarked
    pub elapsed_hours: Option<f64>,
    pub enabled: bool,
    /// Resolved label, or the configured identifier when unresolved
    pub tracked: String,

    // === PID configuration snapshot ===
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub max_cumulative_volume: f64,
    pub proportional_on_measurement: bool,

    // === Tick result ===
    /// Measurement fed to the controller, `None` when no measurement was taken
    pub input: Option<f64>,
    /// Volume commanded (or attempted) this tick (mL)
    pub output: f64,
    /// Cumulative volume for this pump after the tick (mL)
    pub cumulative_dispensed: f64,

    // === Dispense status ===
    pub pump_id: String,
    pub outcome: DispenseOutcome,
    pub cap_limited: bool,
}

impl AuditLogEntry {
    /// Column names, in write order.
    pub const HEADER: [&'static str; 18] = [
        "timestamp",
        "elapsed_hours",
        "enabled",
        "tracked",
        "setpoint",
        "kp",
        "ki",
        "kd",
        "output_min",
        "output_max",
        "max_cumulative_volume",
        "proportional_on_measurement",
        "input",
        "output",
        "cumulative_dispensed",
        "pump_id",
        "dispense_status",
        "cap_limited",
    ];

    /// Render every column as text, in `HEADER` order.
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.timestamp.format(AUDIT_TIMESTAMP_FORMAT).to_string(),
            self.elapsed_hours
                .map_or_else(|| "NaN".to_string(), |h| format!("{h:.3}")),
            enabled_label(self.enabled).to_string(),
            self.tracked.clone(),
            self.setpoint.to_string(),
            self.kp.to_string(),
            self.ki.to_string(),
            self.kd.to_string(),
            self.output_min.to_string(),
            self.output_max.to_string(),
            self.max_cumulative_volume.to_string(),
            enabled_label(self.proportional_on_measurement).to_string(),
            self.input.map_or_else(|| "NaN".to_string(), |v| v.to_string()),
            self.output.to_string(),
            self.cumulative_dispensed.to_string(),
            self.pump_id.clone(),
            self.outcome.to_string(),
            self.cap_limited.to_string(),
        ]
    }
}

fn enabled_label(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_entry() -> AuditLogEntry {
        AuditLogEntry {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            elapsed_hours: None,
            enabled: true,
            tracked: "Glucose".to_string(),
            setpoint: 40.0,
            kp: 0.001,
            ki: 0.1,
            kd: 0.0,
            output_min: 0.0,
            output_max: 0.5,
            max_cumulative_volume: 10.0,
            proportional_on_measurement: false,
            input: Some(1.2),
            output: 0.2,
            cumulative_dispensed: 10.0,
            pump_id: "feed".to_string(),
            outcome: DispenseOutcome::Dispensed,
            cap_limited: true,
        }
    }

    #[test]
    fn fields_line_up_with_header() {
        let fields = sample_entry().to_fields();
        assert_eq!(fields.len(), AuditLogEntry::HEADER.len());
        assert_eq!(fields[0], "2024-01-01 00:00:00");
        assert_eq!(fields[1], "NaN");
        assert_eq!(fields[2], "Enabled");
        assert_eq!(fields[11], "Disabled");
        assert_eq!(fields[13], "0.2");
        assert_eq!(fields[16], "dispensed");
        assert_eq!(fields[17], "true");
    }

    #[test]
    fn elapsed_uses_three_decimals() {
        let mut entry = sample_entry();
        entry.elapsed_hours = Some(1.23456);
        assert_eq!(entry.to_fields()[1], "1.235");
    }

    #[test]
    fn failed_outcome_carries_reason() {
        let outcome = DispenseOutcome::Failed("timeout".to_string());
        assert_eq!(outcome.to_string(), "failed: timeout");
        assert!(!outcome.is_dispensed());
        assert_eq!(
            DispenseOutcome::Skipped(SkipReason::Faulted).to_string(),
            "skipped: faulted"
        );
    }
}
