//! In-process pump for dry runs and tests
//!
//! Behaves like a connected Masterflex drive without any hardware. A
//! [`SimulatedPumpHandle`] stays with the caller after the pump is handed to
//! the orchestrator, so tests can inspect what was dispensed and inject
//! faults.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

use super::{
    deliverable_volume, protocol, validate_draft, CommandError, ConnectionError, ControlMode, DeviceStatus, DispenseReceipt,
    MotorStatus, PortInfo, PumpChannel, PumpConfigError, PumpError, PumpFault,
};
use crate::types::{PumpConfig, PumpConfigDraft};

#[derive(Debug, Default)]
struct SimState {
    ports: Vec<String>,
    dispensed: Vec<f64>,
    calibrations: Vec<f64>,
    connects: Vec<String>,
    fail_next_dispense: Option<CommandError>,
    hang_next_dispense: bool,
    dispense_delay: Option<Duration>,
    refuse_connect: bool,
}

/// Shared view of a [`SimulatedPump`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedPumpHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPumpHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Volumes of every dispense that reached the drive, after truncation
    /// to whole 0.01-revolution steps.
    pub fn dispensed(&self) -> Vec<f64> {
        self.lock().dispensed.clone()
    }

    pub fn total_dispensed(&self) -> f64 {
        self.lock().dispensed.iter().sum()
    }

    /// Ports passed to successful connects, in order.
    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    /// Make the next dispense fail with `error`.
    pub fn fail_next_dispense(&self, error: CommandError) {
        self.lock().fail_next_dispense = Some(error);
    }

    /// Make the next dispense never complete.
    pub fn hang_next_dispense(&self) {
        self.lock().hang_next_dispense = true;
    }

    /// Make every dispense take `delay` before it is acknowledged.
    pub fn delay_dispenses(&self, delay: Duration) {
        self.lock().dispense_delay = Some(delay);
    }

    /// Revolution counts of every calibration run.
    pub fn calibrations(&self) -> Vec<f64> {
        self.lock().calibrations.clone()
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }
}

pub struct SimulatedPump {
    id: String,
    handle: SimulatedPumpHandle,
    port: Option<String>,
    config: Option<PumpConfig>,
}

impl SimulatedPump {
    /// A simulated pump reachable on `ports`.
    pub fn new(id: impl Into<String>, ports: &[&str]) -> (Self, SimulatedPumpHandle) {
        let handle = SimulatedPumpHandle::default();
        handle.lock().ports = ports.iter().map(|p| (*p).to_string()).collect();
        let pump = Self {
            id: id.into(),
            handle: handle.clone(),
            port: None,
            config: None,
        };
        (pump, handle)
    }
}

#[async_trait]
impl PumpChannel for SimulatedPump {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>, PumpError> {
        Ok(self
            .handle
            .lock()
            .ports
            .iter()
            .map(|name| PortInfo {
                name: name.clone(),
                description: "simulated pump".to_string(),
            })
            .collect())
    }

    async fn connect(&mut self, port: &str) -> Result<(), ConnectionError> {
        {
            let mut state = self.handle.lock();
            if state.refuse_connect || !state.ports.iter().any(|p| p == port) {
                return Err(ConnectionError {
                    port: port.to_string(),
                    reason: "no pump answered".to_string(),
                });
            }
            state.connects.push(port.to_string());
        }
        self.port = Some(port.to_string());
        info!(pump = %self.id, port, "Simulated pump connected");
        Ok(())
    }

    fn configure(&mut self, draft: &PumpConfigDraft) -> Result<(), PumpConfigError> {
        self.config = Some(validate_draft(draft)?);
        Ok(())
    }

    async fn dispense(&mut self, volume: f64) -> Result<DispenseReceipt, CommandError> {
        let config = self.config.as_ref().ok_or(CommandError::NotConfigured)?;
        if self.port.is_none() {
            return Err(CommandError::NotConnected);
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(CommandError::InvalidVolume(volume.to_string()));
        }
        let metered = deliverable_volume(config, volume);
        if metered == 0.0 && volume > 0.0 {
            return Err(CommandError::BelowResolution {
                volume: volume.to_string(),
            });
        }
        let revolutions = protocol::floor_revolutions(config.volume_to_revolutions(volume));

        let (hang, delay) = {
            let mut state = self.handle.lock();
            if let Some(error) = state.fail_next_dispense.take() {
                return Err(error);
            }
            (std::mem::take(&mut state.hang_next_dispense), state.dispense_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.handle.lock().dispensed.push(metered);
        Ok(DispenseReceipt {
            volume: metered,
            revolutions,
        })
    }

    async fn run_revolutions(&mut self, revolutions: f64) -> Result<DispenseReceipt, CommandError> {
        let config = self.config.as_ref().ok_or(CommandError::NotConfigured)?;
        if self.port.is_none() {
            return Err(CommandError::NotConnected);
        }
        let field = protocol::revolutions_field(revolutions).map_err(CommandError::InvalidVolume)?;
        if field == 0.0 {
            return Err(CommandError::InvalidVolume(format!("{revolutions} revolutions")));
        }
        self.handle.lock().calibrations.push(field);
        Ok(DispenseReceipt {
            volume: field * config.volume_per_rev,
            revolutions: field,
        })
    }

    async fn status(&mut self) -> Result<DeviceStatus, CommandError> {
        if self.port.is_none() {
            return Err(CommandError::NotConnected);
        }
        Ok(DeviceStatus {
            control: ControlMode::Remote,
            motor: MotorStatus::Idle,
            fault: PumpFault::None,
        })
    }

    async fn disconnect(&mut self) {
        if let Some(port) = self.port.take() {
            info!(pump = %self.id, port = %port, "Simulated pump disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn config(&self) -> Option<&PumpConfig> {
        self.config.as_ref()
    }

    fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn ready_pump() -> (SimulatedPump, SimulatedPumpHandle) {
        let (mut pump, handle) = SimulatedPump::new("sim", &["SIM0"]);
        pump.configure(&PumpConfigDraft {
            port: Some("SIM0".to_string()),
            volume_per_rev: Some(0.8),
            speed_rpm: Some(50.0),
            direction: Some(Direction::Clockwise),
        })
        .unwrap();
        (pump, handle)
    }

    #[tokio::test]
    async fn records_dispensed_volume() {
        let (mut pump, handle) = ready_pump();
        pump.connect("SIM0").await.unwrap();

        let receipt = pump.dispense(1.6).await.unwrap();

        assert!((receipt.revolutions - 2.0).abs() < 1e-12);
        assert_eq!(handle.dispensed(), vec![1.6]);
    }

    #[tokio::test]
    async fn unknown_port_is_refused() {
        let (mut pump, handle) = ready_pump();
        assert!(pump.connect("SIM9").await.is_err());
        assert!(!pump.is_connected());
        assert!(handle.connects().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_is_one_shot() {
        let (mut pump, handle) = ready_pump();
        pump.connect("SIM0").await.unwrap();
        handle.fail_next_dispense(CommandError::Nack {
            command: "P01G".to_string(),
        });

        assert!(pump.dispense(1.0).await.is_err());
        assert!(pump.dispense(1.0).await.is_ok());
        assert_eq!(handle.dispensed(), vec![1.0]);
    }

    #[tokio::test]
    async fn meters_like_the_drive() {
        let (mut pump, handle) = ready_pump();
        pump.connect("SIM0").await.unwrap();

        // 0.8 mL/rev: 0.01 rev is 0.008 mL
        let receipt = pump.dispense(0.0125).await.unwrap();
        assert!((receipt.volume - 0.008).abs() < 1e-12);
        assert!(matches!(
            pump.dispense(0.005).await,
            Err(CommandError::BelowResolution { .. })
        ));
        assert_eq!(handle.dispensed().len(), 1);
        assert!(handle.dispensed()[0] <= 0.0125);
    }

    #[tokio::test]
    async fn calibration_is_recorded_apart_from_dispenses() {
        let (mut pump, handle) = ready_pump();
        pump.connect("SIM0").await.unwrap();

        let receipt = pump.run_revolutions(5.0).await.unwrap();

        assert!((receipt.volume - 4.0).abs() < 1e-12);
        assert_eq!(handle.calibrations(), vec![5.0]);
        assert!(handle.dispensed().is_empty());
    }
}
