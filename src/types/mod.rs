//! Shared data structures for the Raman feed-control pipeline
//!
//! This module defines the plain data that flows between stages:
//! - Acquisition: RawSpectrum (raw spectrometer export)
//! - Prediction: PredictionHeader, PredictionRecord (chemometric engine output)
//! - Control: PidConfig, PidState, DispenseDecision
//! - Actuation: PumpConfig, PumpConfigDraft, Direction
//! - Audit: AuditLogEntry, DispenseOutcome

mod audit;
mod control;
mod prediction;
mod pump;
mod spectrum;

pub use audit::*;
pub use control::*;
pub use prediction::*;
pub use pump::*;
pub use spectrum::*;
