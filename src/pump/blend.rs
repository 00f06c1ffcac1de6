//! Two drives fed as one pump
//!
//! A [`BlendedPump`] owns two physical channels and splits every dose
//! between them: `ratio` of the volume goes to the first member, the rest
//! to the second. The members run one after the other. Each member keeps
//! its own port and configuration, so a blend is configured through its
//! members and connects them on their configured ports.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    CommandError, ConnectionError, DeviceStatus, DispenseReceipt, PortInfo, PumpChannel,
    PumpConfigError, PumpError,
};
use crate::types::{PumpConfig, PumpConfigDraft};

pub struct BlendedPump {
    id: String,
    first: Box<dyn PumpChannel>,
    second: Box<dyn PumpChannel>,
    ratio: f64,
}

impl BlendedPump {
    /// `ratio` is the share of each dose delivered by `first`, in `0..=1`.
    pub fn new(
        id: impl Into<String>,
        first: Box<dyn PumpChannel>,
        second: Box<dyn PumpChannel>,
        ratio: f64,
    ) -> Result<Self, PumpConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(PumpConfigError::InvalidConfig(format!(
                "blend ratio must be within 0..=1 (got {ratio})"
            )));
        }
        if first.id() == second.id() {
            return Err(PumpConfigError::InvalidConfig(format!(
                "blend needs two different pumps (got '{}' twice)",
                first.id()
            )));
        }
        Ok(Self {
            id: id.into(),
            first,
            second,
            ratio,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn members(&self) -> [&str; 2] {
        [self.first.id(), self.second.id()]
    }

    /// Volumes each member can deliver for a `volume` dose.
    fn split(&self, volume: f64) -> (f64, f64) {
        if !(volume.is_finite() && volume > 0.0) {
            return (0.0, 0.0);
        }
        let first = self.first.deliverable(volume * self.ratio);
        let second = self.second.deliverable((volume - first).max(0.0));
        (first, second)
    }
}

async fn connect_member(member: &mut dyn PumpChannel) -> Result<bool, ConnectionError> {
    if member.is_connected() {
        return Ok(false);
    }
    member.connect_configured().await.map_err(|e| match e {
        PumpError::Connection(e) => e,
        other => ConnectionError {
            port: member.id().to_string(),
            reason: other.to_string(),
        },
    })?;
    Ok(true)
}

#[async_trait]
impl PumpChannel for BlendedPump {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>, PumpError> {
        self.first.list_ports()
    }

    async fn connect(&mut self, port: &str) -> Result<(), ConnectionError> {
        Err(ConnectionError {
            port: port.to_string(),
            reason: format!(
                "'{}' connects its members '{}' and '{}' on their own ports",
                self.id,
                self.first.id(),
                self.second.id()
            ),
        })
    }

    async fn connect_configured(&mut self) -> Result<(), PumpError> {
        let opened_first = connect_member(self.first.as_mut()).await?;
        if let Err(e) = connect_member(self.second.as_mut()).await {
            if opened_first {
                self.first.disconnect().await;
            }
            return Err(e.into());
        }
        info!(pump = %self.id, members = ?self.members(), "Blended pump connected");
        Ok(())
    }

    fn configure(&mut self, _draft: &PumpConfigDraft) -> Result<(), PumpConfigError> {
        Err(PumpConfigError::InvalidConfig(format!(
            "configure the member pumps '{}' and '{}' instead",
            self.first.id(),
            self.second.id()
        )))
    }

    async fn dispense(&mut self, volume: f64) -> Result<DispenseReceipt, CommandError> {
        if !self.is_ready() {
            return Err(if self.is_connected() {
                CommandError::NotConfigured
            } else {
                CommandError::NotConnected
            });
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(CommandError::InvalidVolume(volume.to_string()));
        }
        let (first_share, second_share) = self.split(volume);
        if first_share + second_share == 0.0 && volume > 0.0 {
            return Err(CommandError::BelowResolution {
                volume: volume.to_string(),
            });
        }

        let mut total = DispenseReceipt {
            volume: 0.0,
            revolutions: 0.0,
        };
        for (member, share) in [
            (self.first.as_mut(), first_share),
            (self.second.as_mut(), second_share),
        ] {
            if share <= 0.0 {
                continue;
            }
            let receipt = match member.dispense(share).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(pump = %member.id(), share, error = %e, "Blend member dispense failed");
                    return Err(e);
                }
            };
            total.volume += receipt.volume;
            total.revolutions += receipt.revolutions;
        }
        info!(pump = %self.id, volume = total.volume, first = first_share, second = second_share, "Blend dispensed");
        Ok(total)
    }

    fn deliverable(&self, volume: f64) -> f64 {
        let (first, second) = self.split(volume);
        first + second
    }

    async fn run_revolutions(&mut self, _revolutions: f64) -> Result<DispenseReceipt, CommandError> {
        Err(CommandError::Unsupported(format!(
            "calibrate the member pumps '{}' and '{}' one at a time",
            self.first.id(),
            self.second.id()
        )))
    }

    async fn status(&mut self) -> Result<DeviceStatus, CommandError> {
        let first = self.first.status().await?;
        let second = self.second.status().await?;
        Ok(if second.is_faulted() { second } else { first })
    }

    async fn disconnect(&mut self) {
        self.first.disconnect().await;
        self.second.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.first.is_connected() && self.second.is_connected()
    }

    /// A blend has no settings of its own.
    fn config(&self) -> Option<&PumpConfig> {
        None
    }

    fn port(&self) -> Option<&str> {
        None
    }

    fn is_ready(&self) -> bool {
        self.first.is_ready() && self.second.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{SimulatedPump, SimulatedPumpHandle};
    use crate::types::Direction;

    fn member(id: &str, port: &str, volume_per_rev: f64) -> (Box<dyn PumpChannel>, SimulatedPumpHandle) {
        let (mut pump, handle) = SimulatedPump::new(id, &[port]);
        pump.configure(&PumpConfigDraft {
            port: Some(port.to_string()),
            volume_per_rev: Some(volume_per_rev),
            speed_rpm: Some(50.0),
            direction: Some(Direction::Clockwise),
        })
        .unwrap();
        (Box::new(pump), handle)
    }

    fn blend(ratio: f64) -> (BlendedPump, SimulatedPumpHandle, SimulatedPumpHandle) {
        let (a, a_handle) = member("acid", "SIM0", 0.5);
        let (b, b_handle) = member("base", "SIM1", 0.5);
        (BlendedPump::new("mix", a, b, ratio).unwrap(), a_handle, b_handle)
    }

    #[tokio::test]
    async fn dose_is_split_by_ratio() {
        let (mut pump, a, b) = blend(0.25);
        pump.connect_configured().await.unwrap();
        assert!(pump.is_ready());

        let receipt = pump.dispense(2.0).await.unwrap();

        assert!((receipt.volume - 2.0).abs() < 1e-9);
        assert!((a.total_dispensed() - 0.5).abs() < 1e-9);
        assert!((b.total_dispensed() - 1.5).abs() < 1e-9);
        assert_eq!(a.connects(), vec!["SIM0"]);
        assert_eq!(b.connects(), vec!["SIM1"]);
    }

    #[tokio::test]
    async fn whole_ratio_uses_one_member() {
        let (mut pump, a, b) = blend(1.0);
        pump.connect_configured().await.unwrap();

        pump.dispense(1.0).await.unwrap();

        assert_eq!(a.dispensed(), vec![1.0]);
        assert!(b.dispensed().is_empty());
    }

    #[tokio::test]
    async fn failed_member_connect_leaves_both_closed() {
        let (mut pump, a, b) = blend(0.5);
        b.set_refuse_connect(true);

        assert!(pump.connect_configured().await.is_err());

        assert!(!pump.is_connected());
        assert_eq!(a.connects(), vec!["SIM0"]);
        assert!(!pump.first.is_connected());
    }

    #[tokio::test]
    async fn deliverable_matches_what_the_members_meter() {
        let (a, _) = member("acid", "SIM0", 3.0);
        let (b, _) = member("base", "SIM1", 0.5);
        let pump = BlendedPump::new("mix", a, b, 0.5).unwrap();

        // acid meters 0.09 of its 0.1 share, base makes up the rest
        let volume = pump.deliverable(0.2);
        assert!(volume <= 0.2);
        assert!((volume - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn blend_is_configured_and_calibrated_through_members() {
        let (mut pump, _, _) = blend(0.5);
        assert!(pump.configure(&PumpConfigDraft::default()).is_err());
        assert!(pump.connect("SIM0").await.is_err());
        pump.connect_configured().await.unwrap();
        assert!(matches!(
            pump.run_revolutions(5.0).await,
            Err(CommandError::Unsupported(_))
        ));
    }

    #[test]
    fn ratio_outside_unit_interval_is_refused() {
        let (a, _) = member("acid", "SIM0", 0.5);
        let (b, _) = member("base", "SIM1", 0.5);
        assert!(BlendedPump::new("mix", a, b, 1.5).is_err());
    }
}
