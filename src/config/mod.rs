//! Controller Configuration
//!
//! Operator-tunable settings loaded from a TOML file.
//!
//! ## Loading Order
//!
//! 1. `--config <PATH>` on the command line
//! 2. `RAMAN_PID_CONFIG` environment variable (path to TOML file)
//! 3. `raman_pid.toml` in the current working directory
//! 4. Built-in defaults from [`defaults`]
//!
//! The loaded [`ControlConfig`] is passed down explicitly. Only the `[pid]`
//! section is hot-reloaded (see [`watcher`]).

mod control_config;
pub mod defaults;
pub mod validation;
pub mod watcher;

pub use control_config::*;
pub use watcher::{ConfigEvent, ConfigWatcher};
