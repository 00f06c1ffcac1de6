//! Control Pipeline
//!
//! ```text
//! raw spectra dir ──SpectrumPoller──▶ reformatted dir ──▶ (prediction engine)
//!                                                              │
//! prediction file ◀────────────────────────────────────────────┘
//!       │
//!       └──PredictionPoller──▶ PumpWorker ──▶ ControlOrchestrator ──▶ PumpChannel
//!                                 ▲                   │
//!              Console ───────────┘                   └──▶ AuditLog
//! ```
//!
//! The orchestrator lives inside the worker task; everything else talks to
//! it through an [`OperatorHandle`].

pub mod console;
pub mod orchestrator;
pub mod pollers;
mod state;
pub mod worker;

pub use console::{Console, ConsoleCommand};
pub use orchestrator::{ControlOrchestrator, OrchestratorError, OrchestratorSettings};
pub use pollers::{PredictionPoller, SpectrumPoller};
pub use state::*;
pub use worker::{OperatorHandle, PumpWorker, WorkerMessage};
