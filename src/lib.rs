//! raman-pid: closed-loop feed control from Raman predictions
//!
//! Tails the result file of a chemometric prediction engine, runs one PID
//! tick per new prediction and turns the output into a metered dose on a
//! peristaltic pump. Every tick is recorded in an append-only audit log.
//!
//! ## Architecture
//!
//! - **Acquisition**: raw spectrum reformatting and prediction file tailing
//! - **Control**: PID controller with cumulative-volume cap and hot-swappable config
//! - **Pump**: serial pump channel (Masterflex protocol) plus a simulated pump
//! - **Pipeline**: orchestrator state machine, worker task, pollers and console
//! - **Storage**: audit log and process lock

pub mod acquisition;
pub mod clock;
pub mod config;
pub mod control;
pub mod pipeline;
pub mod pump;
pub mod storage;
pub mod types;

pub use config::ControlConfig;

pub use types::{
    AuditLogEntry, DispenseOutcome, PidConfig, PidState, PredictionHeader, PredictionRecord,
    PumpConfig, PumpConfigDraft, TrackedValue,
};

pub use acquisition::{PredictionStream, SpectrumReformatter};
pub use clock::ElapsedTimeClock;
pub use control::{PidConfigStore, PidController};
pub use pipeline::{ControlOrchestrator, ControlState, OperatorHandle, PumpWorker};
pub use pump::{PumpChannel, SerialPumpChannel, SimulatedPump};
pub use storage::{AuditLog, ProcessLock};
