//! Pump worker task
//!
//! The orchestrator is owned by a single task. Prediction batches from the
//! poller and operator commands arrive on one mpsc channel and are handled
//! strictly in order, so an operator command never interleaves with a
//! dispense in progress. Cancellation is checked between the records of a
//! batch, so shutdown waits for at most one dispense.

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::{ControlOrchestrator, OrchestratorError};
use super::state::StatusSnapshot;
use crate::acquisition::StreamPoll;
use crate::clock::ElapsedTimeClock;
use crate::control::ControlError;
use crate::pump::{DispenseReceipt, PortInfo, PumpError};
use crate::types::{PidConfig, PumpConfigDraft};

type Reply<T> = oneshot::Sender<T>;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum WorkerMessage {
    /// Newly consumed prediction lines
    Predictions(StreamPoll),
    SetEnabled {
        enabled: bool,
        response_tx: Reply<()>,
    },
    Connect {
        pump: String,
        port: Option<String>,
        response_tx: Reply<Result<(), OrchestratorError>>,
    },
    Disconnect {
        pump: String,
        response_tx: Reply<Result<(), OrchestratorError>>,
    },
    Configure {
        pump: String,
        draft: PumpConfigDraft,
        response_tx: Reply<Result<(), OrchestratorError>>,
    },
    Designate {
        pump: String,
        response_tx: Reply<Result<(), OrchestratorError>>,
    },
    Calibrate {
        pump: String,
        revolutions: f64,
        response_tx: Reply<Result<DispenseReceipt, OrchestratorError>>,
    },
    ReplacePid {
        config: PidConfig,
        response_tx: Reply<Result<(), ControlError>>,
    },
    ListPorts {
        response_tx: Reply<Result<Vec<PortInfo>, PumpError>>,
    },
    Status {
        response_tx: Reply<StatusSnapshot>,
    },
}

// ============================================================================
// Operator Handle
// ============================================================================

/// Cloneable front end to the worker, used by the console, the pollers and
/// the config watcher.
#[derive(Clone)]
pub struct OperatorHandle {
    tx: mpsc::Sender<WorkerMessage>,
    clock: Arc<ElapsedTimeClock>,
}

impl OperatorHandle {
    /// Set the elapsed-time mark to now. Does not wait for the worker.
    pub fn mark(&self) {
        self.clock.mark(Local::now().naive_local());
    }

    /// Queue a prediction batch.
    pub async fn submit(&self, poll: StreamPoll) -> Result<()> {
        self.tx
            .send(WorkerMessage::Predictions(poll))
            .await
            .context("Pump worker channel closed")
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|response_tx| WorkerMessage::SetEnabled {
            enabled,
            response_tx,
        })
        .await
    }

    pub async fn connect(&self, pump: &str, port: Option<&str>) -> Result<()> {
        let pump = pump.to_string();
        let port = port.map(str::to_string);
        self.request(|response_tx| WorkerMessage::Connect {
            pump,
            port,
            response_tx,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn disconnect(&self, pump: &str) -> Result<()> {
        let pump = pump.to_string();
        self.request(|response_tx| WorkerMessage::Disconnect { pump, response_tx })
            .await?
            .map_err(Into::into)
    }

    pub async fn configure(&self, pump: &str, draft: PumpConfigDraft) -> Result<()> {
        let pump = pump.to_string();
        self.request(|response_tx| WorkerMessage::Configure {
            pump,
            draft,
            response_tx,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn designate(&self, pump: &str) -> Result<()> {
        let pump = pump.to_string();
        self.request(|response_tx| WorkerMessage::Designate { pump, response_tx })
            .await?
            .map_err(Into::into)
    }

    /// Turn a pump a fixed number of revolutions for volume-per-rev calibration.
    pub async fn calibrate(&self, pump: &str, revolutions: f64) -> Result<DispenseReceipt> {
        let pump = pump.to_string();
        self.request(|response_tx| WorkerMessage::Calibrate {
            pump,
            revolutions,
            response_tx,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn replace_pid(&self, config: PidConfig) -> Result<()> {
        self.request(|response_tx| WorkerMessage::ReplacePid {
            config,
            response_tx,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn list_ports(&self) -> Result<Vec<PortInfo>> {
        self.request(|response_tx| WorkerMessage::ListPorts { response_tx })
            .await?
            .map_err(Into::into)
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.request(|response_tx| WorkerMessage::Status { response_tx })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> WorkerMessage) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .context("Pump worker channel closed")?;
        response_rx.await.context("Response channel closed")
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct PumpWorker {
    orchestrator: ControlOrchestrator,
    rx: mpsc::Receiver<WorkerMessage>,
    cancel: CancellationToken,
}

impl PumpWorker {
    pub fn new(
        orchestrator: ControlOrchestrator,
        clock: Arc<ElapsedTimeClock>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, OperatorHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                orchestrator,
                rx,
                cancel,
            },
            OperatorHandle { tx, clock },
        )
    }

    /// Process messages until cancelled or every handle is dropped, then
    /// stop the orchestrator and release the pumps.
    pub async fn run(mut self) -> ControlOrchestrator {
        info!("Pump worker started");
        self.orchestrator.start();

        loop {
            let msg = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                msg = self.rx.recv() => msg,
            };
            let Some(msg) = msg else {
                debug!("All operator handles dropped");
                break;
            };
            if !self.handle(msg).await {
                break;
            }
        }

        self.orchestrator.stop().await;
        info!("Pump worker stopped");
        self.orchestrator
    }

    /// Returns false once the orchestrator refuses further records.
    async fn handle(&mut self, msg: WorkerMessage) -> bool {
        let orch = &mut self.orchestrator;
        match msg {
            WorkerMessage::Predictions(poll) => {
                if let Some(header) = &poll.header {
                    if let Err(e) = orch.handle_header(header) {
                        error!(error = %e, "Cannot resolve tracked value against prediction header");
                    }
                }
                for record in &poll.records {
                    if self.cancel.is_cancelled() {
                        info!("Shutdown requested; leaving the rest of the batch");
                        return false;
                    }
                    match orch.handle_record(record).await {
                        Ok(entry) => debug!(
                            pump = %entry.pump_id,
                            output = entry.output,
                            outcome = %entry.outcome,
                            "Record processed"
                        ),
                        Err(OrchestratorError::Stopped) => return false,
                        Err(e @ OrchestratorError::AlreadyAudited { .. }) => debug!(error = %e, "Record skipped"),
                        Err(e) => error!(error = %e, "Record could not be processed"),
                    }
                }
            }
            WorkerMessage::SetEnabled {
                enabled,
                response_tx,
            } => {
                orch.set_enabled(enabled);
                info!(enabled, "Automatic control toggled");
                let _ = response_tx.send(());
            }
            WorkerMessage::Connect {
                pump,
                port,
                response_tx,
            } => {
                let result = orch.connect(&pump, port.as_deref()).await;
                if let Err(e) = &result {
                    warn!(pump = %pump, error = %e, "Connect failed");
                }
                let _ = response_tx.send(result);
            }
            WorkerMessage::Disconnect { pump, response_tx } => {
                let _ = response_tx.send(orch.disconnect(&pump).await);
            }
            WorkerMessage::Configure {
                pump,
                draft,
                response_tx,
            } => {
                let _ = response_tx.send(orch.configure_pump(&pump, &draft));
            }
            WorkerMessage::Designate { pump, response_tx } => {
                let _ = response_tx.send(orch.designate(&pump));
            }
            WorkerMessage::Calibrate {
                pump,
                revolutions,
                response_tx,
            } => {
                let result = orch.calibrate(&pump, revolutions).await;
                if let Err(e) = &result {
                    warn!(pump = %pump, error = %e, "Calibration failed");
                }
                let _ = response_tx.send(result);
            }
            WorkerMessage::ReplacePid {
                config,
                response_tx,
            } => {
                let result = orch.replace_pid_config(config);
                if let Err(e) = &result {
                    warn!(error = %e, "PID configuration rejected");
                }
                let _ = response_tx.send(result);
            }
            WorkerMessage::ListPorts { response_tx } => {
                let _ = response_tx.send(orch.list_ports());
            }
            WorkerMessage::Status { response_tx } => {
                let _ = response_tx.send(orch.status());
            }
        }
        true
    }
}
