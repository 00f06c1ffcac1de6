//! Lint pass over `raman_pid.toml`
//!
//! Runs beside the serde load and never blocks it. Keys are checked table
//! by table against [`SCHEMA`], so a misspelt key is matched only against
//! the fields of the table it sits in. Values that deserialize but look
//! like operator mistakes are reported by [`suspicious_values`].

use super::ControlConfig;

/// A non-fatal finding about the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    /// Dotted path of the key, `pumps.port` for any `[[pumps]]` entry
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        match &self.suggestion {
            Some(s) => write!(f, "; did you mean '{s}'?"),
            None => Ok(()),
        }
    }
}

/// Largest edit distance still offered as a correction.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Field names of every table, keyed by dotted table path. `""` is the
/// document root. Array-of-tables entries use the array's path.
///
/// Mirrors `ControlConfig`; `known_keys_cover_the_serialized_form` fails
/// when the two drift apart.
const SCHEMA: &[(&str, &[&str])] = &[
    (
        "",
        &[
            "designated_pump",
            "paths",
            "polling",
            "reformatter",
            "pid",
            "pump_link",
            "audit",
            "pumps",
            "blends",
        ],
    ),
    (
        "paths",
        &["raw_spectra_dir", "reformatted_dir", "prediction_file", "data_dir"],
    ),
    (
        "polling",
        &[
            "prediction_interval_ms",
            "spectra_interval_ms",
            "settle_polls",
            "config_watch_interval_secs",
            "replay_backlog",
        ],
    ),
    (
        "reformatter",
        &[
            "data_start_row",
            "shift_column",
            "intensity_column",
            "min_points",
            "format",
            "process_existing",
        ],
    ),
    (
        "pid",
        &[
            "setpoint",
            "kp",
            "ki",
            "kd",
            "output_min",
            "output_max",
            "max_cumulative_volume",
            "proportional_on_measurement",
            "tracked",
            "smoothing_window",
            "start_enabled",
        ],
    ),
    (
        "pump_link",
        &["baud_rate", "command_timeout_ms", "reply_idle_ms", "dispense_timeout_ms"],
    ),
    ("audit", &["mode", "file_name"]),
    (
        "pumps",
        &[
            "id",
            "port",
            "address",
            "volume_per_rev",
            "speed_rpm",
            "direction",
            "auto_connect",
        ],
    ),
    ("blends", &["id", "first", "second", "ratio"]),
];

fn fields_of(table: &str) -> Option<&'static [&'static str]> {
    SCHEMA
        .iter()
        .find(|(path, _)| *path == table)
        .map(|(_, fields)| *fields)
}

fn join(table: &str, key: &str) -> String {
    if table.is_empty() {
        key.to_string()
    } else {
        format!("{table}.{key}")
    }
}

/// Insert/delete/substitute distance, one rolling row.
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal
            } else {
                1 + diagonal.min(above).min(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Closest field of `table` to `key`; ties go to the alphabetically first.
fn nearest_field(table: &str, key: &str) -> Option<String> {
    fields_of(table)?
        .iter()
        .map(|field| (edit_distance(key, field), *field))
        .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .min()
        .map(|(_, field)| join(table, field))
}

/// Warn about every key the config model does not know. Unknown tables are
/// reported once, not descended into. Text that is not TOML yields nothing;
/// the serde load reports it.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ConfigWarning> {
    let Ok(root) = raw_toml.parse::<toml::Table>() else {
        return Vec::new();
    };

    let mut warnings = Vec::new();
    let mut pending: Vec<(String, &toml::Table)> = vec![(String::new(), &root)];
    while let Some((path, table)) = pending.pop() {
        let fields = fields_of(&path).unwrap_or_default();
        for (key, value) in table {
            let field = join(&path, key);
            if !fields.contains(&key.as_str()) {
                warnings.push(ConfigWarning {
                    suggestion: nearest_field(&path, key),
                    message: format!("Unknown config key '{field}'"),
                    field,
                });
                continue;
            }
            match value {
                toml::Value::Table(inner) => pending.push((field, inner)),
                toml::Value::Array(items) => pending.extend(
                    items
                        .iter()
                        .filter_map(toml::Value::as_table)
                        .map(|inner| (field.clone(), inner)),
                ),
                _ => {}
            }
        }
    }
    warnings.sort_by(|a, b| a.field.cmp(&b.field));
    warnings.dedup_by(|a, b| a.field == b.field);
    warnings
}

/// Values that load fine but probably are not what the operator meant.
pub fn suspicious_values(config: &ControlConfig) -> Vec<ConfigWarning> {
    let mut found = Vec::new();
    let mut note = |field: &str, message: String| {
        found.push(ConfigWarning {
            field: field.to_string(),
            message,
            suggestion: None,
        });
    };

    let pid = &config.pid;
    if pid.max_cumulative_volume == 0.0 {
        note(
            "pid.max_cumulative_volume",
            "pid.max_cumulative_volume is 0; the pump will never dispense".to_string(),
        );
    } else if pid.output_max > pid.max_cumulative_volume {
        note(
            "pid.output_max",
            format!(
                "pid.output_max ({}) exceeds pid.max_cumulative_volume ({}); one tick could use the whole budget",
                pid.output_max, pid.max_cumulative_volume
            ),
        );
    }
    if [pid.kp, pid.ki, pid.kd].iter().all(|g| *g == 0.0) {
        note("pid", "all PID gains are 0; output will stay at output_min".to_string());
    }
    if [pid.kp, pid.ki, pid.kd].iter().any(|g| *g < 0.0) {
        note(
            "pid",
            "negative PID gain; the pump will dose harder as the value rises".to_string(),
        );
    }

    if config.pumps.is_empty() {
        note(
            "pumps",
            "no [[pumps]] configured; control stays in Watching until one is added".to_string(),
        );
    }
    for pump in config.pumps.iter().filter(|p| p.auto_connect && p.port.is_none()) {
        note(
            "pumps.auto_connect",
            format!("pump '{}' has auto_connect but no port", pump.id),
        );
    }
    for blend in &config.blends {
        let idle = match blend.ratio {
            r if r == 0.0 => Some(&blend.first),
            r if r == 1.0 => Some(&blend.second),
            _ => None,
        };
        if let Some(idle) = idle {
            note(
                "blends.ratio",
                format!("blend '{}' never runs '{idle}' at ratio {}", blend.id, blend.ratio),
            );
        }
    }

    if config.paths.raw_spectra_dir == config.paths.reformatted_dir {
        note(
            "paths.reformatted_dir",
            "paths.reformatted_dir equals raw_spectra_dir; reformatted files will be picked up as raw".to_string(),
        );
    }

    found
}
