//! Closed-loop control
//!
//! The PID controller and the shared, swappable configuration it reads at
//! every tick boundary.

pub mod pid;

pub use pid::{PidConfigStore, PidController};

use crate::types::TrackedValue;
use thiserror::Error;

/// Controller-side failures. None of these ever move volume.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// Tick attempted before the tracked identifier was resolved
    #[error("controller not ready: tracked identifier not resolved against a header")]
    NotReady,

    /// Measurement is NaN or infinite
    #[error("measurement {0} is not a finite number")]
    InvalidMeasurement(f64),

    /// Candidate configuration failed validation
    #[error("invalid PID configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// A new configuration tried to retarget the loop after resolution
    #[error("tracked identifier is locked to '{locked}' for this run (requested '{requested}')")]
    TrackedIdentifierLocked {
        locked: TrackedValue,
        requested: TrackedValue,
    },

    /// Header does not contain the configured identifier
    #[error("tracked identifier '{tracked}' not found in header [{}]", .labels.join(", "))]
    UnknownTrackedIdentifier {
        tracked: TrackedValue,
        labels: Vec<String>,
    },
}
