//! Controller configuration file model
//!
//! Every section is `#[serde(default)]`, so a config file only needs the
//! keys it changes. An empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::acquisition::{SpectrumLayout, SpectrumOutputFormat};
use crate::pump::protocol;
use crate::storage::AuditMode;
use crate::types::{Direction, PidConfig, PumpConfigDraft, TrackedValue};

// ============================================================================
// Top Level
// ============================================================================

/// Root of `raman_pid.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Pump or blend the PID loop drives at startup; defaults to the first `[[pumps]]` entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub designated_pump: Option<String>,
    pub paths: PathsConfig,
    pub polling: PollingConfig,
    pub reformatter: ReformatterConfig,
    pub pid: PidSection,
    pub pump_link: PumpLinkConfig,
    pub audit: AuditConfig,
    pub pumps: Vec<PumpEntry>,
    pub blends: Vec<BlendEntry>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            designated_pump: None,
            paths: PathsConfig::default(),
            polling: PollingConfig::default(),
            reformatter: ReformatterConfig::default(),
            pid: PidSection::default(),
            pump_link: PumpLinkConfig::default(),
            audit: AuditConfig::default(),
            pumps: Vec::new(),
            blends: Vec::new(),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory the spectrometer writes raw exports into
    pub raw_spectra_dir: PathBuf,
    /// Directory the prediction engine reads reformatted spectra from
    pub reformatted_dir: PathBuf,
    /// Results file the prediction engine appends to
    pub prediction_file: PathBuf,
    /// Audit log and process lock location
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_spectra_dir: PathBuf::from(defaults::RAW_SPECTRA_DIR),
            reformatted_dir: PathBuf::from(defaults::REFORMATTED_DIR),
            prediction_file: PathBuf::from(defaults::PREDICTION_FILE),
            data_dir: PathBuf::from(defaults::DATA_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub prediction_interval_ms: u64,
    pub spectra_interval_ms: u64,
    /// Polls a raw file's size must hold steady before it is read
    pub settle_polls: u32,
    pub config_watch_interval_secs: u64,
    /// Run the PID loop over predictions already in the file at startup
    pub replay_backlog: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            prediction_interval_ms: defaults::PREDICTION_POLL_INTERVAL_MS,
            spectra_interval_ms: defaults::SPECTRA_POLL_INTERVAL_MS,
            settle_polls: defaults::SPECTRA_SETTLE_POLLS,
            config_watch_interval_secs: defaults::CONFIG_WATCH_INTERVAL_SECS,
            replay_backlog: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReformatterConfig {
    pub data_start_row: usize,
    pub shift_column: usize,
    pub intensity_column: usize,
    pub min_points: usize,
    pub format: SpectrumOutputFormat,
    /// Reformat files already in the raw directory at startup
    pub process_existing: bool,
}

impl Default for ReformatterConfig {
    fn default() -> Self {
        let layout = SpectrumLayout::default();
        Self {
            data_start_row: layout.data_start_row,
            shift_column: layout.shift_column,
            intensity_column: layout.intensity_column,
            min_points: layout.min_points,
            format: SpectrumOutputFormat::default(),
            process_existing: false,
        }
    }
}

impl ReformatterConfig {
    pub fn layout(&self) -> SpectrumLayout {
        SpectrumLayout {
            data_start_row: self.data_start_row,
            shift_column: self.shift_column,
            intensity_column: self.intensity_column,
            min_points: self.min_points,
        }
    }
}

/// `[pid]`: the hot-reloadable part of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidSection {
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub max_cumulative_volume: f64,
    pub proportional_on_measurement: bool,
    /// Column index or header label
    pub tracked: TrackedValue,
    pub smoothing_window: usize,
    /// Automatic control on at startup
    pub start_enabled: bool,
}

impl Default for PidSection {
    fn default() -> Self {
        let pid = PidConfig::default();
        Self {
            setpoint: pid.setpoint,
            kp: pid.kp,
            ki: pid.ki,
            kd: pid.kd,
            output_min: pid.output_min,
            output_max: pid.output_max,
            max_cumulative_volume: pid.max_cumulative_volume,
            proportional_on_measurement: pid.proportional_on_measurement,
            tracked: pid.tracked,
            smoothing_window: defaults::PID_SMOOTHING_WINDOW,
            start_enabled: false,
        }
    }
}

impl PidSection {
    pub fn to_pid_config(&self) -> PidConfig {
        PidConfig {
            setpoint: self.setpoint,
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            output_min: self.output_min,
            output_max: self.output_max,
            max_cumulative_volume: self.max_cumulative_volume,
            proportional_on_measurement: self.proportional_on_measurement,
            tracked: self.tracked.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpLinkConfig {
    pub baud_rate: u32,
    /// Bound on one command/reply exchange
    pub command_timeout_ms: u64,
    /// Quiet period that ends a reply
    pub reply_idle_ms: u64,
    /// Bound on a whole dispense sequence before the pump is faulted
    pub dispense_timeout_ms: u64,
}

impl Default for PumpLinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: defaults::PUMP_BAUD_RATE,
            command_timeout_ms: defaults::PUMP_COMMAND_TIMEOUT_MS,
            reply_idle_ms: defaults::PUMP_REPLY_IDLE_MS,
            dispense_timeout_ms: defaults::DISPENSE_TIMEOUT_MS,
        }
    }
}

impl PumpLinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reply_idle(&self) -> Duration {
        Duration::from_millis(self.reply_idle_ms)
    }

    pub fn dispense_timeout(&self) -> Duration {
        Duration::from_millis(self.dispense_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub mode: AuditMode,
    /// File name in append mode, name template in session mode
    pub file_name: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mode: AuditMode::default(),
            file_name: defaults::AUDIT_FILE_NAME.to_string(),
        }
    }
}

/// One `[[pumps]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpEntry {
    pub id: String,
    pub port: Option<String>,
    /// Position on the serial daisy chain (1–25)
    pub address: u8,
    pub volume_per_rev: Option<f64>,
    pub speed_rpm: Option<f64>,
    pub direction: Option<Direction>,
    /// Connect at startup when a port is set
    pub auto_connect: bool,
}

impl Default for PumpEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            port: None,
            address: 1,
            volume_per_rev: Some(defaults::PUMP_VOLUME_PER_REV),
            speed_rpm: Some(defaults::PUMP_SPEED_RPM),
            direction: Some(Direction::Clockwise),
            auto_connect: true,
        }
    }
}

impl PumpEntry {
    pub fn draft(&self) -> PumpConfigDraft {
        PumpConfigDraft {
            port: self.port.clone(),
            volume_per_rev: self.volume_per_rev,
            speed_rpm: self.speed_rpm,
            direction: self.direction,
        }
    }
}

/// One `[[blends]]` entry: two `[[pumps]]` driven as a single pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendEntry {
    pub id: String,
    pub first: String,
    pub second: String,
    /// Share of each dose delivered by `first`
    pub ratio: f64,
}

impl Default for BlendEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            first: String::new(),
            second: String::new(),
            ratio: 0.5,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl ControlConfig {
    /// Load configuration using the standard search order:
    /// 1. `explicit` (the `--config` flag)
    /// 2. `$RAMAN_PID_CONFIG`
    /// 3. `./raman_pid.toml`
    /// 4. Built-in defaults
    ///
    /// Returns the file the configuration came from, if any. A file that
    /// exists but does not load is an error, never a silent fallback.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "Loaded config from --config");
            return Ok((config, Some(path.to_path_buf())));
        }

        if let Ok(raw) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let path = PathBuf::from(&raw);
            if path.exists() {
                let config = Self::load_from_file(&path)?;
                info!(path = %path.display(), "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                return Ok((config, Some(path)));
            }
            warn!(path = %raw, "{} points to a missing file, falling back", defaults::CONFIG_ENV_VAR);
        }

        let local = PathBuf::from(defaults::CONFIG_FILE_NAME);
        if local.exists() {
            let config = Self::load_from_file(&local)?;
            info!("Loaded config from ./{}", defaults::CONFIG_FILE_NAME);
            return Ok((config, Some(local)));
        }

        info!("No {} found, using built-in defaults", defaults::CONFIG_FILE_NAME);
        Ok((Self::default(), None))
    }

    /// Load and validate one file. Unknown keys are logged, not rejected.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for w in super::validation::validate_unknown_keys(&contents) {
            warn!(path = %path.display(), "{w}");
        }
        let config = Self::parse(path, &contents)?;
        for w in super::validation::suspicious_values(&config) {
            warn!(path = %path.display(), field = %w.field, "{w}");
        }
        Ok(config)
    }

    /// Parse and validate TOML text attributed to `path`.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every section and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.pid.to_pid_config().validation_errors();

        if self.pid.smoothing_window == 0 {
            errors.push("pid.smoothing_window must be at least 1".to_string());
        }

        for (name, value) in [
            ("polling.prediction_interval_ms", self.polling.prediction_interval_ms),
            ("polling.spectra_interval_ms", self.polling.spectra_interval_ms),
            ("polling.config_watch_interval_secs", self.polling.config_watch_interval_secs),
            ("pump_link.command_timeout_ms", self.pump_link.command_timeout_ms),
            ("pump_link.reply_idle_ms", self.pump_link.reply_idle_ms),
            ("pump_link.dispense_timeout_ms", self.pump_link.dispense_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }
        if self.pump_link.baud_rate == 0 {
            errors.push("pump_link.baud_rate must be greater than 0".to_string());
        }

        let r = &self.reformatter;
        for (name, value) in [
            ("reformatter.data_start_row", r.data_start_row),
            ("reformatter.shift_column", r.shift_column),
            ("reformatter.intensity_column", r.intensity_column),
        ] {
            if value == 0 {
                errors.push(format!("{name} is 1-based and must be at least 1"));
            }
        }
        if r.shift_column == r.intensity_column {
            errors.push("reformatter.shift_column and intensity_column must differ".to_string());
        }

        if self.audit.file_name.trim().is_empty() {
            errors.push("audit.file_name must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for pump in &self.pumps {
            if pump.id.trim().is_empty() {
                errors.push("pumps: id must not be empty".to_string());
            } else if !seen.insert(pump.id.as_str()) {
                errors.push(format!("pumps: duplicate id '{}'", pump.id));
            }
            if let Err(e) = protocol::validate_address(pump.address) {
                errors.push(format!("pumps.{}: {e}", pump.id));
            }
            if let Some(vpr) = pump.volume_per_rev {
                if !(vpr.is_finite() && vpr > 0.0) {
                    errors.push(format!("pumps.{}: volume_per_rev must be > 0 (got {vpr})", pump.id));
                }
            }
            if let Some(rpm) = pump.speed_rpm {
                if let Err(e) = protocol::validate_rpm(rpm) {
                    errors.push(format!("pumps.{}: {e}", pump.id));
                }
            }
        }

        let mut members = HashSet::new();
        for blend in &self.blends {
            if blend.id.trim().is_empty() {
                errors.push("blends: id must not be empty".to_string());
                continue;
            }
            if !seen.insert(blend.id.as_str()) {
                errors.push(format!("blends: id '{}' is already in use", blend.id));
            }
            if !(0.0..=1.0).contains(&blend.ratio) {
                errors.push(format!(
                    "blends.{}: ratio must be within 0..=1 (got {})",
                    blend.id, blend.ratio
                ));
            }
            if blend.first == blend.second {
                errors.push(format!("blends.{}: first and second must differ", blend.id));
            }
            for member in [&blend.first, &blend.second] {
                if !self.pumps.iter().any(|p| &p.id == member) {
                    errors.push(format!(
                        "blends.{}: '{member}' does not match any [[pumps]] id",
                        blend.id
                    ));
                } else if blend.first != blend.second && !members.insert(member.as_str()) {
                    errors.push(format!(
                        "blends.{}: pump '{member}' already belongs to another blend",
                        blend.id
                    ));
                }
            }
        }

        if let Some(designated) = &self.designated_pump {
            if !seen.contains(designated.as_str()) {
                errors.push(format!(
                    "designated_pump '{designated}' does not match any [[pumps]] or [[blends]] id"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Names of sections that differ from `other`, `[pid]` excluded.
    pub fn restart_required_changes(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.designated_pump != other.designated_pump {
            changed.push("designated_pump");
        }
        if self.paths != other.paths {
            changed.push("paths");
        }
        if self.polling != other.polling {
            changed.push("polling");
        }
        if self.reformatter != other.reformatter {
            changed.push("reformatter");
        }
        if self.pump_link != other.pump_link {
            changed.push("pump_link");
        }
        if self.audit != other.audit {
            changed.push("audit");
        }
        if self.pumps != other.pumps {
            changed.push("pumps");
        }
        if self.blends != other.blends {
            changed.push("blends");
        }
        changed
    }

    /// How long shutdown waits for the worker and pollers: one bounded
    /// dispense, a stop command per pump, plus slack.
    pub fn shutdown_grace(&self) -> Duration {
        let link = &self.pump_link;
        let stops = u32::try_from(self.pumps.len() + 1).unwrap_or(u32::MAX);
        link.dispense_timeout()
            + link.command_timeout().saturating_mul(stops)
            + Duration::from_millis(defaults::SHUTDOWN_GRACE_MS)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config validation failed:\n{}", format_errors(.0))]
    Validation(Vec<String>),
}

fn format_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ControlConfig, ConfigError> {
        ControlConfig::parse(Path::new("test.toml"), text)
    }

    #[test]
    fn empty_file_is_defaults() {
        assert_eq!(parse("").unwrap(), ControlConfig::default());
    }

    #[test]
    fn pump_without_id_is_rejected() {
        let err = parse("[[pumps]]\nport = \"COM3\"\n").unwrap_err();
        assert!(err.to_string().contains("id must not be empty"));
    }

    #[test]
    fn full_file_parses() {
        let config = parse(
            r#"
designated_pump = "base"

[paths]
prediction_file = "/data/AutoSave.txt"

[reformatter]
data_start_row = 25
format = "instep"

[pid]
setpoint = 12.5
tracked = "Glucose"
smoothing_window = 4

[audit]
mode = "session"

[[pumps]]
id = "feed"
port = "/dev/ttyUSB0"
direction = "ccw"

[[pumps]]
id = "base"
address = 2
auto_connect = false
"#,
        )
        .unwrap();

        assert_eq!(config.designated_pump.as_deref(), Some("base"));
        assert_eq!(config.paths.prediction_file, PathBuf::from("/data/AutoSave.txt"));
        assert_eq!(config.reformatter.layout().data_start_row, 25);
        assert_eq!(config.reformatter.format, SpectrumOutputFormat::Instep);
        assert_eq!(config.pid.tracked, TrackedValue::Label("Glucose".to_string()));
        assert_eq!(config.pid.smoothing_window, 4);
        assert_eq!(config.audit.mode, AuditMode::Session);
        assert_eq!(config.pumps[0].direction, Some(Direction::CounterClockwise));
        assert_eq!(config.pumps[0].speed_rpm, Some(defaults::PUMP_SPEED_RPM));
        assert_eq!(config.pumps[1].address, 2);
        assert!(!config.pumps[1].auto_connect);
    }

    #[test]
    fn tracked_index_parses() {
        let config = parse("[pid]\ntracked = 2\n").unwrap();
        assert_eq!(config.pid.tracked, TrackedValue::Index(2));
    }

    #[test]
    fn validation_collects_every_error() {
        let err = parse(
            r#"
designated_pump = "missing"

[pid]
output_min = 5.0
output_max = 1.0
smoothing_window = 0

[[pumps]]
id = "a"
address = 30

[[pumps]]
id = "a"
speed_rpm = 2.0
"#,
        )
        .unwrap_err();

        let ConfigError::Validation(errors) = err else {
            panic!("expected validation error, got {err}");
        };
        let all = errors.join("\n");
        assert!(all.contains("pid.smoothing_window"));
        assert!(all.contains("output_min"));
        assert!(all.contains("duplicate id 'a'"));
        assert!(all.contains("address"));
        assert!(all.contains("speed"));
        assert!(all.contains("designated_pump 'missing'"));
    }

    #[test]
    fn bad_toml_is_parse_error() {
        assert!(matches!(
            parse("[pid\nsetpoint = 1"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = ControlConfig::default();
        config.pumps.push(PumpEntry {
            id: "pump1".to_string(),
            port: Some("/dev/ttyUSB0".to_string()),
            ..PumpEntry::default()
        });
        config.designated_pump = Some("pump1".to_string());
        let text = config.to_toml().unwrap();
        assert_eq!(parse(&text).unwrap(), config);
    }

    #[test]
    fn blends_reference_configured_pumps() {
        let config = parse(
            r#"
designated_pump = "mix"

[[pumps]]
id = "acid"

[[pumps]]
id = "base"

[[blends]]
id = "mix"
first = "acid"
second = "base"
ratio = 0.3
"#,
        )
        .unwrap();
        assert_eq!(config.blends[0].ratio, 0.3);

        let err = parse(
            r#"
[[pumps]]
id = "acid"

[[pumps]]
id = "base"

[[blends]]
id = "acid"
first = "acid"
second = "ghost"
ratio = 1.5

[[blends]]
id = "other"
first = "acid"
second = "base"
"#,
        )
        .unwrap_err();
        let all = err.to_string();
        assert!(all.contains("id 'acid' is already in use"));
        assert!(all.contains("'ghost' does not match"));
        assert!(all.contains("ratio must be within"));
        assert!(all.contains("already belongs to another blend"));
    }

    #[test]
    fn shutdown_grace_outlasts_a_dispense() {
        let mut config = ControlConfig::default();
        config.pump_link.dispense_timeout_ms = 60_000;
        config.pumps.push(PumpEntry {
            id: "feed".to_string(),
            ..PumpEntry::default()
        });
        assert!(config.shutdown_grace() > config.pump_link.dispense_timeout());
        assert!(
            config.shutdown_grace()
                >= config.pump_link.dispense_timeout() + config.pump_link.command_timeout() * 2
        );
    }

    #[test]
    fn restart_sections_exclude_pid() {
        let old = ControlConfig::default();
        let mut new = old.clone();
        new.pid.setpoint = 1.0;
        assert!(new.restart_required_changes(&old).is_empty());
        new.polling.settle_polls = 5;
        assert_eq!(new.restart_required_changes(&old), vec!["polling"]);
        new.blends.push(BlendEntry::default());
        assert_eq!(new.restart_required_changes(&old), vec!["polling", "blends"]);
    }
}
