//! Control Orchestrator
//!
//! Owns the pumps, one PID controller per pump, the audit log and the state
//! machine. Every prediction record goes through [`ControlOrchestrator::handle_record`]:
//!
//! 1. Snapshot the elapsed-time mark and the PID configuration
//! 2. Pull and smooth the tracked value
//! 3. If `Active`: tick the designated pump's controller and dispense the output
//! 4. Append exactly one audit row, whatever happened
//!
//! The orchestrator is driven from a single task (see `pipeline::worker`), so
//! the tick-dispense-log sequence for a pump is never interleaved with another.

use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::state::{ControlState, PumpStatus, StatusSnapshot};
use crate::clock::ElapsedTimeClock;
use crate::config::defaults;
use crate::control::{ControlError, PidConfigStore, PidController};
use crate::pump::{
    CommandError, DispenseReceipt, PortInfo, PumpChannel, PumpConfigError, PumpError,
};
use crate::storage::{AuditError, AuditLog};
use crate::types::{
    AuditLogEntry, DispenseOutcome, PidConfig, PidState, PredictionHeader, PredictionRecord,
    PumpConfigDraft, ResolvedTracking, SkipReason,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is stopped")]
    Stopped,

    /// The record is not newer than the last row of the audit log it resumed from.
    #[error("record at {timestamp} is already in the audit log")]
    AlreadyAudited { timestamp: NaiveDateTime },

    #[error("pump '{pump}' is under automatic control; disable control or designate another pump first")]
    ControlActive { pump: String },

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Pump(#[from] PumpError),
}

/// Tuning that does not belong to the PID configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Recent tracked values averaged into one measurement
    pub smoothing_window: usize,
    /// Outer bound on one dispense, after which the pump is faulted
    pub dispense_timeout: Duration,
    /// Automatic control on at startup
    pub start_enabled: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            smoothing_window: defaults::PID_SMOOTHING_WINDOW,
            dispense_timeout: Duration::from_millis(defaults::DISPENSE_TIMEOUT_MS),
            start_enabled: false,
        }
    }
}

struct PumpSlot {
    channel: Box<dyn PumpChannel>,
    controller: PidController,
}

/// Outcome of one record, before it is turned into an audit row.
struct TickResult {
    input: Option<f64>,
    output: f64,
    cumulative: f64,
    enabled: bool,
    cap_limited: bool,
    outcome: DispenseOutcome,
    config: Arc<PidConfig>,
}

pub struct ControlOrchestrator {
    pumps: BTreeMap<String, PumpSlot>,
    designated: Option<String>,
    store: Arc<PidConfigStore>,
    clock: Arc<ElapsedTimeClock>,
    audit: AuditLog,
    settings: OrchestratorSettings,
    header: Option<PredictionHeader>,
    tracking: Option<ResolvedTracking>,
    /// Timestamp of the newest row in the audit log at startup
    resume_after: Option<NaiveDateTime>,
    window: VecDeque<f64>,
    enabled: bool,
    state: ControlState,
    records_processed: u64,
    last_measurement: Option<f64>,
    last_output: Option<f64>,
}

impl ControlOrchestrator {
    pub fn new(
        store: Arc<PidConfigStore>,
        clock: Arc<ElapsedTimeClock>,
        audit: AuditLog,
        settings: OrchestratorSettings,
    ) -> Self {
        let window = VecDeque::with_capacity(settings.smoothing_window.max(1));
        let resume_after = audit.last_timestamp();
        if let Some(after) = resume_after {
            info!(after = %after, "Records up to the last audited timestamp will be skipped");
        }
        Self {
            pumps: BTreeMap::new(),
            designated: None,
            store,
            clock,
            audit,
            enabled: settings.start_enabled,
            settings,
            header: None,
            tracking: None,
            resume_after,
            window,
            state: ControlState::Idle,
            records_processed: 0,
            last_measurement: None,
            last_output: None,
        }
    }

    /// Register a pump. Its cumulative volume resumes from the audit log.
    ///
    /// The first pump added becomes the designated one.
    pub fn add_pump(&mut self, channel: Box<dyn PumpChannel>) -> Result<(), PumpError> {
        let id = channel.id().to_string();
        if self.pumps.contains_key(&id) {
            return Err(PumpConfigError::InvalidConfig(format!("duplicate pump id '{id}'")).into());
        }

        let cumulative = self.audit.recovered_cumulative(&id).unwrap_or(0.0);
        let mut controller = PidController::with_state(
            Arc::clone(&self.store),
            PidState::resumed(cumulative),
            self.enabled,
        );
        if let Some(tracking) = &self.tracking {
            controller.bind_tracking(tracking.clone());
        }
        info!(pump = %id, cumulative, "Pump registered");

        if self.designated.is_none() {
            self.designated = Some(id.clone());
        }
        self.pumps.insert(id, PumpSlot { channel, controller });
        self.reevaluate();
        Ok(())
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn designated(&self) -> Option<&str> {
        self.designated.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tracking(&self) -> Option<&ResolvedTracking> {
        self.tracking.as_ref()
    }

    /// Begin accepting records.
    pub fn start(&mut self) {
        if matches!(self.state, ControlState::Idle) {
            self.set_state(ControlState::Watching);
            self.reevaluate();
        }
    }

    // ========================================================================
    // Stream Input
    // ========================================================================

    /// Resolve the tracked identifier against the stream header.
    ///
    /// Happens once per run; the identifier is then locked in the config store.
    /// The header is kept, so a configuration that fails to resolve can be
    /// corrected with [`replace_pid_config`](Self::replace_pid_config).
    pub fn handle_header(
        &mut self,
        header: &PredictionHeader,
    ) -> Result<ResolvedTracking, ControlError> {
        if let Some(existing) = &self.tracking {
            return Ok(existing.clone());
        }
        self.header = Some(header.clone());
        self.resolve_tracking(header)
    }

    fn resolve_tracking(
        &mut self,
        header: &PredictionHeader,
    ) -> Result<ResolvedTracking, ControlError> {
        let config = self.store.load();
        let resolved =
            header
                .resolve(&config.tracked)
                .ok_or_else(|| ControlError::UnknownTrackedIdentifier {
                    tracked: config.tracked.clone(),
                    labels: header.labels.clone(),
                })?;

        self.store.lock_tracking(config.tracked.clone());
        for slot in self.pumps.values_mut() {
            slot.controller.bind_tracking(resolved.clone());
        }
        info!(
            label = %resolved.label,
            index = resolved.index,
            columns = header.len(),
            "Tracked prediction resolved"
        );
        self.tracking = Some(resolved.clone());
        self.reevaluate();
        Ok(resolved)
    }

    /// Process one new prediction record. Appends exactly one audit row.
    pub async fn handle_record(
        &mut self,
        record: &PredictionRecord,
    ) -> Result<AuditLogEntry, OrchestratorError> {
        if self.state.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }
        if let Some(after) = self.resume_after {
            if record.timestamp <= after {
                return Err(OrchestratorError::AlreadyAudited {
                    timestamp: record.timestamp,
                });
            }
            self.resume_after = None;
        }

        // Tick boundary: both snapshots hold for the whole record.
        let mark = self.clock.snapshot();
        let config = self.store.load();

        let raw = self.tracking.as_ref().and_then(|t| t.measure(record));
        let measurement = match raw {
            Some(v) if v.is_finite() => Some(self.smooth(v)),
            _ => None,
        };

        let result = match (measurement, self.tracking.is_some()) {
            (_, false) => self.skipped(None, SkipReason::NotReady, config),
            (None, true) => {
                warn!(offset = record.offset, value = ?raw, "Tracked value unusable, record skipped");
                self.skipped(None, SkipReason::InvalidMeasurement, config)
            }
            (Some(m), true) if self.state.is_active() => self.tick_and_dispense(m, record).await,
            (Some(m), true) if self.state.is_faulted() => {
                self.skipped(Some(m), SkipReason::Faulted, config)
            }
            (Some(m), true) => self.skipped(Some(m), SkipReason::PumpNotReady, config),
        };

        let entry = AuditLogEntry {
            timestamp: record.timestamp,
            elapsed_hours: mark.elapsed(record.timestamp).hours(),
            enabled: result.enabled,
            tracked: self
                .tracking
                .as_ref()
                .map_or_else(|| result.config.tracked.to_string(), |t| t.label.clone()),
            setpoint: result.config.setpoint,
            kp: result.config.kp,
            ki: result.config.ki,
            kd: result.config.kd,
            output_min: result.config.output_min,
            output_max: result.config.output_max,
            max_cumulative_volume: result.config.max_cumulative_volume,
            proportional_on_measurement: result.config.proportional_on_measurement,
            input: result.input,
            output: result.output,
            cumulative_dispensed: result.cumulative,
            pump_id: self.designated.clone().unwrap_or_default(),
            outcome: result.outcome,
            cap_limited: result.cap_limited,
        };

        self.records_processed += 1;
        self.last_measurement = result.input;
        self.last_output = Some(result.output);

        if let Err(e) = self.audit.append(&entry) {
            error!(error = %e, "Audit log write failed, dispensing halted");
            self.fault(format!("audit log write failed: {e}"));
            return Err(e.into());
        }
        Ok(entry)
    }

    async fn tick_and_dispense(&mut self, measurement: f64, record: &PredictionRecord) -> TickResult {
        let dispense_timeout = self.settings.dispense_timeout;
        let Some(PumpSlot {
            channel,
            controller,
        }) = self
            .designated
            .as_ref()
            .and_then(|id| self.pumps.get_mut(id))
        else {
            let config = self.store.load();
            return self.skipped(Some(measurement), SkipReason::PumpNotReady, config);
        };

        let ticked = controller.tick_metered(measurement, record.timestamp, |volume| {
            channel.deliverable(volume)
        });
        let decision = match ticked {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Controller refused tick");
                let config = self.store.load();
                return self.skipped(Some(measurement), SkipReason::NotReady, config);
            }
        };

        if decision.cap_limited {
            warn!(
                pump = %channel.id(),
                requested = decision.clamped_output,
                output = decision.output,
                cumulative = decision.cumulative_dispensed,
                ceiling = decision.config.max_cumulative_volume,
                "Output limited by cumulative volume ceiling"
            );
        }
        debug!(
            measurement,
            raw_output = decision.raw_output,
            output = decision.output,
            cumulative = decision.cumulative_dispensed,
            "PID tick"
        );

        let mut result = TickResult {
            input: Some(measurement),
            output: decision.output,
            cumulative: decision.cumulative_dispensed,
            enabled: decision.enabled,
            cap_limited: decision.cap_limited,
            outcome: DispenseOutcome::Dispensed,
            config: Arc::clone(&decision.config),
        };

        if !decision.enabled {
            result.outcome = DispenseOutcome::Skipped(SkipReason::Disabled);
            return result;
        }
        if decision.output <= 0.0 {
            result.outcome = DispenseOutcome::Skipped(SkipReason::NothingToDispense);
            return result;
        }

        let outcome =
            match tokio::time::timeout(dispense_timeout, channel.dispense(decision.output)).await {
                Ok(Ok(receipt)) => {
                    if (receipt.volume - decision.output).abs() > 1e-6 {
                        warn!(
                            pump = %channel.id(),
                            counted = decision.output,
                            delivered = receipt.volume,
                            "Pump delivered a different volume than was counted"
                        );
                    }
                    info!(
                        pump = %channel.id(),
                        volume = receipt.volume,
                        revolutions = receipt.revolutions,
                        cumulative = decision.cumulative_dispensed,
                        "Dispensed"
                    );
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CommandError::Timeout {
                    command: format!("dispense {} mL", decision.output),
                    timeout_ms: dispense_timeout.as_millis() as u64,
                }),
            };

        if let Err(e) = outcome {
            error!(pump = %channel.id(), volume = decision.output, error = %e, "Dispense failed");
            let reason = e.to_string();
            result.outcome = DispenseOutcome::Failed(reason.clone());
            self.fault(reason);
        }
        result
    }

    /// Audit result for a record that produced no pump command.
    fn skipped(&self, input: Option<f64>, reason: SkipReason, config: Arc<PidConfig>) -> TickResult {
        debug!(reason = %reason, "Record audited without dispense");
        TickResult {
            input,
            output: 0.0,
            cumulative: self.designated_slot().map_or(0.0, |s| s.controller.cumulative_dispensed()),
            enabled: self.enabled,
            cap_limited: false,
            outcome: DispenseOutcome::Skipped(reason),
            config,
        }
    }

    fn smooth(&mut self, value: f64) -> f64 {
        let window = self.settings.smoothing_window.max(1);
        self.window.push_back(value);
        while self.window.len() > window {
            self.window.pop_front();
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    // ========================================================================
    // Operator Commands
    // ========================================================================

    /// Connect a pump. `port` falls back to the pump's configured port.
    ///
    /// Reconnecting the designated pump clears a fault. The faulted link is
    /// closed first, so the pump is identified again on a fresh connection.
    pub async fn connect(
        &mut self,
        pump_id: &str,
        port: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        self.ensure_running()?;
        let clears_fault = self.state.is_faulted() && self.designated.as_deref() == Some(pump_id);
        let slot = self.slot_mut(pump_id)?;
        if clears_fault && slot.channel.is_connected() {
            slot.channel.disconnect().await;
        }
        match port {
            Some(port) => slot.channel.connect(port).await.map_err(PumpError::from)?,
            None => slot.channel.connect_configured().await?,
        }

        if self.state.is_faulted() && self.designated.as_deref() == Some(pump_id) {
            info!(pump = pump_id, "Operator reconnect clears fault");
            self.set_state(ControlState::Watching);
        }
        self.reevaluate();
        Ok(())
    }

    pub async fn disconnect(&mut self, pump_id: &str) -> Result<(), OrchestratorError> {
        self.slot_mut(pump_id)?.channel.disconnect().await;
        self.reevaluate();
        Ok(())
    }

    pub fn configure_pump(
        &mut self,
        pump_id: &str,
        draft: &PumpConfigDraft,
    ) -> Result<(), OrchestratorError> {
        self.slot_mut(pump_id)?
            .channel
            .configure(draft)
            .map_err(PumpError::from)?;
        self.reevaluate();
        Ok(())
    }

    /// Make `pump_id` the PID target. Forces `Watching` until it is ready.
    pub fn designate(&mut self, pump_id: &str) -> Result<(), OrchestratorError> {
        self.ensure_running()?;
        if !self.pumps.contains_key(pump_id) {
            return Err(PumpError::UnknownPump(pump_id.to_string()).into());
        }
        if self.designated.as_deref() == Some(pump_id) {
            return Ok(());
        }
        info!(from = ?self.designated, to = pump_id, "Designated pump changed");
        self.designated = Some(pump_id.to_string());
        if matches!(self.state, ControlState::Active | ControlState::Faulted { .. }) {
            self.set_state(ControlState::Watching);
        }
        self.reevaluate();
        Ok(())
    }

    /// Switch automatic control on or off for every controller.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        for slot in self.pumps.values_mut() {
            slot.controller.set_enabled(enabled);
        }
    }

    /// Swap in a new PID configuration; takes effect from the next record.
    ///
    /// While the tracked identifier is unresolved, the new one is tried
    /// against the header already seen.
    pub fn replace_pid_config(&mut self, config: PidConfig) -> Result<(), ControlError> {
        self.store.replace(config)?;
        if self.tracking.is_none() {
            if let Some(header) = self.header.clone() {
                if let Err(e) = self.resolve_tracking(&header) {
                    warn!(error = %e, "Tracked value still not in prediction header");
                }
            }
        }
        self.reevaluate();
        Ok(())
    }

    /// Turn `pump_id` a fixed number of revolutions so its real volume per
    /// revolution can be measured. Not counted toward the cumulative volume.
    pub async fn calibrate(
        &mut self,
        pump_id: &str,
        revolutions: f64,
    ) -> Result<DispenseReceipt, OrchestratorError> {
        self.ensure_running()?;
        if self.enabled
            && self.state.is_active()
            && self.designated.as_deref() == Some(pump_id)
        {
            return Err(OrchestratorError::ControlActive {
                pump: pump_id.to_string(),
            });
        }
        let timeout = self.settings.dispense_timeout;
        let slot = self.slot_mut(pump_id)?;
        let receipt = tokio::time::timeout(timeout, slot.channel.run_revolutions(revolutions))
            .await
            .map_err(|_| CommandError::Timeout {
                command: format!("calibrate {revolutions} rev"),
                timeout_ms: timeout.as_millis() as u64,
            })
            .and_then(|r| r)
            .map_err(PumpError::from)?;
        info!(
            pump = pump_id,
            revolutions = receipt.revolutions,
            nominal_volume = receipt.volume,
            "Calibration run started"
        );
        Ok(receipt)
    }

    pub fn list_ports(&self) -> Result<Vec<PortInfo>, PumpError> {
        match self.designated_slot().or_else(|| self.pumps.values().next()) {
            Some(slot) => slot.channel.list_ports(),
            None => Ok(Vec::new()),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.clone(),
            enabled: self.enabled,
            designated_pump: self.designated.clone(),
            tracked: self.tracking.as_ref().map(|t| t.label.clone()),
            elapsed: self.clock.elapsed(Local::now().naive_local()),
            records_processed: self.records_processed,
            last_measurement: self.last_measurement,
            last_output: self.last_output,
            audit_path: self.audit.path().to_path_buf(),
            pumps: self
                .pumps
                .iter()
                .map(|(id, slot)| PumpStatus {
                    id: id.clone(),
                    designated: self.designated.as_ref() == Some(id),
                    connected: slot.channel.is_connected(),
                    port: slot.channel.port().map(str::to_string),
                    config: slot.channel.config().cloned(),
                    cumulative_dispensed: slot.controller.cumulative_dispensed(),
                })
                .collect(),
        }
    }

    /// Stop accepting records, then release every pump.
    ///
    /// Any dispense already in flight has finished by the time this runs,
    /// because ticks and operator commands share one task.
    pub async fn stop(&mut self) {
        if self.state.is_stopped() {
            return;
        }
        self.set_state(ControlState::Stopped);
        for slot in self.pumps.values_mut() {
            slot.channel.disconnect().await;
        }
        info!(
            records = self.records_processed,
            audit_rows = self.audit.rows_written(),
            "Orchestrator stopped"
        );
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    fn designated_slot(&self) -> Option<&PumpSlot> {
        self.designated.as_ref().and_then(|id| self.pumps.get(id))
    }

    fn slot_mut(&mut self, pump_id: &str) -> Result<&mut PumpSlot, PumpError> {
        self.pumps
            .get_mut(pump_id)
            .ok_or_else(|| PumpError::UnknownPump(pump_id.to_string()))
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.state.is_stopped() {
            Err(OrchestratorError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Move between `Watching` and `Active` as readiness changes.
    fn reevaluate(&mut self) {
        if !matches!(self.state, ControlState::Watching | ControlState::Active) {
            return;
        }
        let ready = self.tracking.is_some()
            && self.store.load().is_valid()
            && self
                .designated_slot()
                .is_some_and(|s| s.channel.is_ready() && s.controller.is_ready());
        let next = if ready {
            ControlState::Active
        } else {
            ControlState::Watching
        };
        if next != self.state {
            self.set_state(next);
        }
    }

    fn fault(&mut self, error: String) {
        if !self.state.is_stopped() {
            self.set_state(ControlState::Faulted { error });
        }
    }

    fn set_state(&mut self, next: ControlState) {
        if next.is_faulted() {
            error!(from = %self.state, to = %next, "Control state changed");
        } else {
            info!(from = %self.state, to = %next, "Control state changed");
        }
        self.state = next;
    }
}
