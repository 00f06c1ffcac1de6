//! System-wide default constants.
//!
//! Centralises the numbers the controller falls back to when the config
//! file is silent. Grouped by subsystem for easy discovery.

// ============================================================================
// Paths
// ============================================================================

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "raman_pid.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "RAMAN_PID_CONFIG";

/// Directory the spectrometer exports raw scans into.
pub const RAW_SPECTRA_DIR: &str = "./spectra";

/// Directory the prediction engine watches for reformatted spectra.
pub const REFORMATTED_DIR: &str = "./spectra/Output";

/// File the prediction engine appends results to.
pub const PREDICTION_FILE: &str = "./predictions/AutoSave.txt";

/// Directory for the audit log and process lock.
pub const DATA_DIR: &str = "./data";

/// Audit log file name (append mode) or stem (session mode).
pub const AUDIT_FILE_NAME: &str = "pid_audit.csv";

// ============================================================================
// Polling
// ============================================================================

/// How often the prediction file is checked for appended lines (ms).
pub const PREDICTION_POLL_INTERVAL_MS: u64 = 1_000;

/// How often the raw spectrum directory is scanned (ms).
pub const SPECTRA_POLL_INTERVAL_MS: u64 = 1_000;

/// Consecutive polls a raw file size must hold steady before it is read.
pub const SPECTRA_SETTLE_POLLS: u32 = 1;

/// How often the config file mtime is checked for hot reload (s).
pub const CONFIG_WATCH_INTERVAL_SECS: u64 = 2;

// ============================================================================
// Spectrum Layout
// ============================================================================

/// First data row in a raw export (1-based). Rows above are metadata.
pub const SPECTRUM_DATA_START_ROW: usize = 24;

/// Raman shift column (1-based).
pub const SPECTRUM_SHIFT_COLUMN: usize = 2;

/// Dark-subtracted intensity column (1-based).
pub const SPECTRUM_INTENSITY_COLUMN: usize = 4;

/// Suffix appended to the source stem to form the placeholder sample id.
pub const SAMPLE_ID_SUFFIX: &str = "_proc";

// ============================================================================
// PID Controller
// ============================================================================

pub const PID_SETPOINT: f64 = 40.0;
pub const PID_KP: f64 = 0.001;
pub const PID_KI: f64 = 0.1;
pub const PID_KD: f64 = 0.0;

/// Per-tick dose bounds (mL).
pub const PID_OUTPUT_MIN: f64 = 0.0;
pub const PID_OUTPUT_MAX: f64 = 20.0;

/// Total volume ceiling per pump (mL).
pub const PID_MAX_CUMULATIVE_VOLUME: f64 = 500.0;

/// Smallest dose increment the pump path resolves (mL).
pub const PID_OUTPUT_RESOLUTION: f64 = 0.01;

/// Number of recent tracked values averaged into one measurement.
pub const PID_SMOOTHING_WINDOW: usize = 1;

// ============================================================================
// Pump Link
// ============================================================================

/// Masterflex serial line settings: 4800 baud, 7 data bits, odd parity, 1 stop bit.
pub const PUMP_BAUD_RATE: u32 = 4_800;

/// Upper bound on any single pump exchange before it is declared failed (ms).
pub const PUMP_COMMAND_TIMEOUT_MS: u64 = 2_000;

/// Quiet period that terminates a pump reply (ms).
pub const PUMP_REPLY_IDLE_MS: u64 = 60;

/// Pump head speed limits (rpm).
pub const PUMP_MIN_RPM: f64 = 10.0;
pub const PUMP_MAX_RPM: f64 = 600.0;

/// Highest pump address on one daisy chain.
pub const PUMP_MAX_ADDRESS: u8 = 25;

/// Head revolutions turned by a calibration run.
pub const CALIBRATION_REVOLUTIONS: f64 = 5.0;

/// Default speed (rpm) and tubing displacement (mL/rev).
pub const PUMP_SPEED_RPM: f64 = 50.0;
pub const PUMP_VOLUME_PER_REV: f64 = 0.8;

// ============================================================================
// Orchestrator
// ============================================================================

/// Bound on queued prediction batches and operator commands.
pub const WORKER_CHANNEL_CAPACITY: usize = 64;

/// Slack on top of the pump I/O bound when shutdown waits for tasks (ms).
pub const SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Outer bound on one complete dispense sequence (speed, revolutions, go) (ms).
pub const DISPENSE_TIMEOUT_MS: u64 = 8_000;
