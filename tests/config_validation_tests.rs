//! Config Validation Tests
//!
//! Loads real files from disk through the public config API: typo
//! detection, validation failures and the values that reach the controller.

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use raman_pid::config::validation::{suspicious_values, validate_unknown_keys};
use raman_pid::config::{ConfigError, ControlConfig};
use raman_pid::types::{Direction, TrackedValue};

fn write_config(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("raman_pid.toml");
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn explicit_path_wins_and_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
designated_pump = "feed"

[pid]
setpoint = 35.0
kp = 0.002
tracked = "Glucose"
start_enabled = true

[[pumps]]
id = "feed"
port = "/dev/ttyUSB0"
volume_per_rev = 1.6
direction = "cw"
"#,
    );

    let (config, source) = ControlConfig::load(Some(&path)).unwrap();

    assert_eq!(source, Some(path));
    let pid = config.pid.to_pid_config();
    assert_eq!(pid.setpoint, 35.0);
    assert_eq!(pid.kp, 0.002);
    assert_eq!(pid.tracked, TrackedValue::Label("Glucose".to_string()));
    assert!(config.pid.start_enabled);

    let draft = config.pumps[0].draft();
    assert_eq!(draft.port.as_deref(), Some("/dev/ttyUSB0"));
    assert_eq!(draft.volume_per_rev, Some(1.6));
    assert_eq!(draft.direction, Some(Direction::Clockwise));
    assert!(draft.complete().is_ok());
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ControlConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn invalid_values_block_startup_with_every_reason() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[pid]
output_min = -1.0
max_cumulative_volume = -5.0

[reformatter]
shift_column = 0
"#,
    );

    let err = ControlConfig::load(Some(&path)).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("pid.output_min"));
    assert!(text.contains("pid.max_cumulative_volume"));
    assert!(text.contains("reformatter.shift_column"));
}

#[test]
fn typo_warns_but_still_loads() {
    let text = r#"
[pid]
setpoint = 20.0
smothing_window = 3
"#;
    let warnings = validate_unknown_keys(text);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].suggestion.as_deref(), Some("pid.smoothing_window"));

    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, text);
    let (config, _) = ControlConfig::load(Some(&path)).unwrap();
    assert_eq!(config.pid.setpoint, 20.0);
    assert_eq!(config.pid.smoothing_window, 1);
}

#[test]
fn effective_config_round_trips_through_check_output() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[audit]
mode = "session"
file_name = "run.csv"

[[pumps]]
id = "a"
port = "COM3"
address = 2
"#,
    );
    let (config, _) = ControlConfig::load(Some(&path)).unwrap();

    let rendered = config.to_toml().unwrap();
    assert!(validate_unknown_keys(&rendered).is_empty());
    let again = write_config(&dir, &rendered);
    let (reloaded, _) = ControlConfig::load(Some(&again)).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn output_cap_above_budget_is_suspicious() {
    let mut config = ControlConfig::default();
    config.pid.output_max = 50.0;
    config.pid.max_cumulative_volume = 10.0;
    assert!(suspicious_values(&config)
        .iter()
        .any(|w| w.field == "pid.output_max"));
}
