//! Serial pump channel
//!
//! Drives one Masterflex pump over a byte link. The link is produced by a
//! [`LinkOpener`], so the same channel runs against a real serial port
//! (`tokio-serial`) or an in-memory pipe in tests.
//!
//! Every exchange is bounded: a reply that does not start within the
//! command timeout becomes [`CommandError::Timeout`]. A reply is complete
//! when it ends in CR, is a single ACK/NAK, or the line goes quiet.
//!
//! An exchange that never got its reply (timed out, or abandoned by the
//! caller) leaves the link stale: a late reply may still be in flight. A
//! reconnect on the same port then reopens the port and repeats the
//! handshake instead of reusing the link.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{self, PumpCommand, Reply, ACK, CR, ENQ, NAK};
use super::{
    validate_draft, CommandError, ConnectionError, DeviceStatus, DispenseReceipt, PortInfo,
    PumpChannel, PumpConfigError, PumpError,
};
use crate::config::defaults;
use crate::types::{PumpConfig, PumpConfigDraft};

// ============================================================================
// Link Opening
// ============================================================================

/// Produces byte links to named ports.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    type Link: AsyncRead + AsyncWrite + Unpin + Send;

    async fn open(&self, port: &str) -> io::Result<Self::Link>;

    fn list_ports(&self) -> io::Result<Vec<PortInfo>>;
}

/// Opens real serial ports with the Masterflex line settings.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    baud_rate: u32,
}

impl SerialPortOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new(defaults::PUMP_BAUD_RATE)
    }
}

#[async_trait]
impl LinkOpener for SerialPortOpener {
    type Link = tokio_serial::SerialStream;

    async fn open(&self, port: &str) -> io::Result<Self::Link> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Seven)
            .parity(tokio_serial::Parity::Odd)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)
    }

    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
        Ok(ports
            .into_iter()
            .map(|p| PortInfo {
                description: describe_port_type(&p.port_type),
                name: p.port_name,
            })
            .collect())
    }
}

fn describe_port_type(port_type: &tokio_serial::SerialPortType) -> String {
    match port_type {
        tokio_serial::SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB serial");
            match usb.manufacturer.as_deref() {
                Some(maker) => format!("{product} ({maker}, {:04x}:{:04x})", usb.vid, usb.pid),
                None => format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid),
            }
        }
        tokio_serial::SerialPortType::PciPort => "PCI serial".to_string(),
        tokio_serial::SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
        tokio_serial::SerialPortType::Unknown => "serial".to_string(),
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Counters for one channel since creation.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SerialPumpStats {
    pub commands_sent: u64,
    pub dispenses: u64,
    pub total_revolutions: f64,
    pub timeouts: u64,
    pub naks: u64,
}

pub struct SerialPumpChannel<O: LinkOpener = SerialPortOpener> {
    id: String,
    address: u8,
    opener: O,
    link: Option<O::Link>,
    port: Option<String>,
    /// Set while an exchange is outstanding, cleared by any reply
    stale: bool,
    config: Option<PumpConfig>,
    command_timeout: Duration,
    reply_idle: Duration,
    stats: SerialPumpStats,
}

impl<O: LinkOpener> SerialPumpChannel<O> {
    pub fn new(id: impl Into<String>, address: u8, opener: O) -> Result<Self, PumpConfigError> {
        let address = protocol::validate_address(address).map_err(PumpConfigError::InvalidConfig)?;
        Ok(Self {
            id: id.into(),
            address,
            opener,
            link: None,
            port: None,
            stale: false,
            config: None,
            command_timeout: Duration::from_millis(defaults::PUMP_COMMAND_TIMEOUT_MS),
            reply_idle: Duration::from_millis(defaults::PUMP_REPLY_IDLE_MS),
            stats: SerialPumpStats::default(),
        })
    }

    /// Override the per-exchange timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Override the quiet period that ends a reply.
    pub fn with_reply_idle(mut self, idle: Duration) -> Self {
        self.reply_idle = idle;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn stats(&self) -> SerialPumpStats {
        self.stats
    }

    /// Send one command and decode the reply.
    async fn exchange(&mut self, command: &PumpCommand) -> Result<Reply, CommandError> {
        let described = command.describe(self.address);
        let frame = command.frame(self.address);
        let link = self.link.as_mut().ok_or(CommandError::NotConnected)?;

        self.stats.commands_sent += 1;
        self.stale = true;
        match transact(link, &frame, self.command_timeout, self.reply_idle).await {
            Ok(bytes) => {
                self.stale = false;
                debug!(pump = %self.id, command = %described, reply = %protocol::printable(&bytes), "Pump exchange");
                Ok(Reply::parse(&bytes))
            }
            Err(LinkFailure::Silent) => {
                self.stats.timeouts += 1;
                Err(CommandError::Timeout {
                    command: described,
                    timeout_ms: self.command_timeout.as_millis() as u64,
                })
            }
            Err(LinkFailure::Io(e)) => {
                warn!(pump = %self.id, error = %e, "Serial link lost");
                self.link = None;
                self.port = None;
                Err(CommandError::Io(e.to_string()))
            }
        }
    }

    /// Send one command that must be acknowledged.
    async fn command(&mut self, command: &PumpCommand) -> Result<(), CommandError> {
        match self.exchange(command).await? {
            Reply::Ack => Ok(()),
            Reply::Nak => {
                self.stats.naks += 1;
                Err(CommandError::Nack {
                    command: command.describe(self.address),
                })
            }
            other => Err(CommandError::UnexpectedReply {
                command: command.describe(self.address),
                reply: format!("{other:?}"),
            }),
        }
    }

    /// True when the last exchange never saw its reply.
    pub fn is_stale(&self) -> bool {
        self.link.is_some() && self.stale
    }

    /// Speed, revolutions, go. `revolutions` is already on the 0.01 grid.
    async fn turn(
        &mut self,
        config: &PumpConfig,
        revolutions: f64,
    ) -> Result<DispenseReceipt, CommandError> {
        let rpm = protocol::validate_rpm(config.speed_rpm).map_err(CommandError::InvalidVolume)?;
        let speed = PumpCommand::SetSpeed {
            direction: config.direction,
            rpm,
        };
        match self.command(&speed).await {
            Err(CommandError::Nack { .. }) => {
                // Drive refuses a direction change while turning; halt and retry once.
                warn!(pump = %self.id, "Speed rejected, halting pump and retrying");
                self.command(&PumpCommand::Halt).await?;
                self.command(&speed).await?;
            }
            other => other?,
        }
        self.command(&PumpCommand::SetRevolutions(revolutions)).await?;
        self.command(&PumpCommand::Go).await?;

        self.stats.dispenses += 1;
        self.stats.total_revolutions += revolutions;
        Ok(DispenseReceipt {
            volume: revolutions * config.volume_per_rev,
            revolutions,
        })
    }

    fn ready_config(&self) -> Result<PumpConfig, CommandError> {
        let config = self.config.clone().ok_or(CommandError::NotConfigured)?;
        if self.link.is_none() {
            return Err(CommandError::NotConnected);
        }
        Ok(config)
    }
}

#[async_trait]
impl<O: LinkOpener> PumpChannel for SerialPumpChannel<O> {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>, PumpError> {
        self.opener
            .list_ports()
            .map_err(|e| PumpError::Enumeration(e.to_string()))
    }

    async fn connect(&mut self, port: &str) -> Result<(), ConnectionError> {
        if self.link.is_some() && self.port.as_deref() == Some(port) {
            if !self.stale {
                return Ok(());
            }
            // The port cannot be opened twice, so the stale link goes first.
            warn!(pump = %self.id, port, "Link has an unanswered command, reopening");
            self.disconnect().await;
        }
        info!(pump = %self.id, port, "Connecting to pump");

        let mut link = tokio::time::timeout(self.command_timeout, self.opener.open(port))
            .await
            .map_err(|_| ConnectionError {
                port: port.to_string(),
                reason: "timed out opening port".to_string(),
            })?
            .map_err(|e| ConnectionError {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        handshake(&mut link, port, self.address, self.command_timeout, self.reply_idle).await?;

        // Only now is it safe to drop the previous connection.
        self.disconnect().await;
        self.link = Some(link);
        self.port = Some(port.to_string());
        self.stale = false;
        info!(pump = %self.id, port, "Pump connected");
        Ok(())
    }

    fn configure(&mut self, draft: &PumpConfigDraft) -> Result<(), PumpConfigError> {
        let config = validate_draft(draft)?;
        info!(
            pump = %self.id,
            port = %config.port,
            volume_per_rev = config.volume_per_rev,
            speed_rpm = config.speed_rpm,
            direction = %config.direction,
            "Pump configured"
        );
        self.config = Some(config);
        Ok(())
    }

    async fn dispense(&mut self, volume: f64) -> Result<DispenseReceipt, CommandError> {
        let config = self.ready_config()?;
        if !volume.is_finite() || volume < 0.0 {
            return Err(CommandError::InvalidVolume(volume.to_string()));
        }

        let revolutions = protocol::revolutions_field(config.volume_to_revolutions(volume))
            .map_err(CommandError::InvalidVolume)?;
        if revolutions == 0.0 {
            if volume > 0.0 {
                return Err(CommandError::BelowResolution {
                    volume: volume.to_string(),
                });
            }
            return Ok(DispenseReceipt {
                volume: 0.0,
                revolutions: 0.0,
            });
        }

        let receipt = self.turn(&config, revolutions).await?;
        info!(pump = %self.id, requested = volume, volume = receipt.volume, revolutions, "Dispense started");
        Ok(receipt)
    }

    async fn run_revolutions(&mut self, revolutions: f64) -> Result<DispenseReceipt, CommandError> {
        let config = self.ready_config()?;
        let field = protocol::revolutions_field(revolutions).map_err(CommandError::InvalidVolume)?;
        if field == 0.0 {
            return Err(CommandError::InvalidVolume(format!("{revolutions} revolutions")));
        }
        let receipt = self.turn(&config, field).await?;
        info!(pump = %self.id, revolutions = field, "Calibration run started");
        Ok(receipt)
    }

    async fn status(&mut self) -> Result<DeviceStatus, CommandError> {
        match self.exchange(&PumpCommand::RequestStatus).await? {
            Reply::Status(status) => Ok(status),
            other => Err(CommandError::UnexpectedReply {
                command: PumpCommand::RequestStatus.describe(self.address),
                reply: format!("{other:?}"),
            }),
        }
    }

    async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let frame = PumpCommand::LocalControl.frame(self.address);
        if let Err(LinkFailure::Io(e)) =
            transact(&mut link, &frame, self.reply_idle * 5, self.reply_idle).await
        {
            debug!(pump = %self.id, error = %e, "Could not return pump to local control");
        }
        let _ = link.shutdown().await;
        self.stale = false;
        info!(pump = %self.id, port = ?self.port.take(), "Pump disconnected");
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn config(&self) -> Option<&PumpConfig> {
        self.config.as_ref()
    }

    fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }
}

// ============================================================================
// Byte Exchange
// ============================================================================

/// ENQ discovery, address assignment and a status query on a fresh link.
async fn handshake<L>(
    link: &mut L,
    port: &str,
    address: u8,
    timeout: Duration,
    idle: Duration,
) -> Result<(), ConnectionError>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    let fail = |reason: String| ConnectionError {
        port: port.to_string(),
        reason,
    };
    let discovery_timeout = idle * 5;

    let mut assigned = 0u8;
    while assigned < defaults::PUMP_MAX_ADDRESS {
        match transact(link, &[ENQ], discovery_timeout, idle).await {
            Ok(bytes) if Reply::parse(&bytes) == Reply::AddressRequest => {}
            Ok(_) | Err(LinkFailure::Silent) => break,
            Err(LinkFailure::Io(e)) => return Err(fail(e.to_string())),
        }
        assigned += 1;
        let frame = PumpCommand::AssignAddress.frame(assigned);
        match transact(link, &frame, timeout, idle).await {
            Ok(bytes) if Reply::parse(&bytes) == Reply::Ack => {
                info!(port, address = assigned, "Pump address assigned");
            }
            Ok(bytes) => {
                return Err(fail(format!(
                    "pump did not acknowledge address {assigned}: {}",
                    protocol::printable(&bytes)
                )))
            }
            Err(LinkFailure::Silent) => {
                return Err(fail(format!("no reply to address assignment {assigned}")))
            }
            Err(LinkFailure::Io(e)) => return Err(fail(e.to_string())),
        }
    }

    let frame = PumpCommand::RequestStatus.frame(address);
    match transact(link, &frame, timeout, idle).await {
        Ok(bytes) => match Reply::parse(&bytes) {
            Reply::Status(status) => {
                info!(port, address, status = %status, "Pump identified");
                Ok(())
            }
            _ => Err(fail(format!(
                "pump {address} did not identify: {}",
                protocol::printable(&bytes)
            ))),
        },
        Err(LinkFailure::Silent) => Err(fail(format!("no pump answered at address {address}"))),
        Err(LinkFailure::Io(e)) => Err(fail(e.to_string())),
    }
}

enum LinkFailure {
    /// Nothing came back before the deadline
    Silent,
    Io(io::Error),
}

/// Write `request` and collect the reply.
async fn transact<L>(
    link: &mut L,
    request: &[u8],
    timeout: Duration,
    idle: Duration,
) -> Result<Vec<u8>, LinkFailure>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    link.write_all(request).await.map_err(LinkFailure::Io)?;
    link.flush().await.map_err(LinkFailure::Io)?;

    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = if reply.is_empty() {
            remaining
        } else {
            idle.min(remaining)
        };
        if wait.is_zero() {
            break;
        }

        match tokio::time::timeout(wait, link.read(&mut buf)).await {
            Ok(Ok(0)) => {
                if reply.is_empty() {
                    return Err(LinkFailure::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial link closed",
                    )));
                }
                break;
            }
            Ok(Ok(n)) => {
                reply.extend_from_slice(&buf[..n]);
                if reply == [ACK] || reply == [NAK] || reply.last() == Some(&CR) {
                    break;
                }
            }
            Ok(Err(e)) => return Err(LinkFailure::Io(e)),
            Err(_) => break,
        }
    }

    if reply.is_empty() {
        Err(LinkFailure::Silent)
    } else {
        Ok(reply)
    }
}
