//! Masterflex L/S serial protocol
//!
//! Framing for Cole-Parmer Masterflex drives on an RS-232 daisy chain
//! (4800 baud, 7 data bits, odd parity, 1 stop bit). Every command is
//! `STX P<nn><body> CR`, where `nn` is the two-digit pump address (1–25).
//!
//! | Command          | Body                | Reply            |
//! |------------------|---------------------|------------------|
//! | assign address   | (empty)             | ACK              |
//! | request status   | `I`                 | five digits      |
//! | set speed        | `S+050.0` / `S-...` | ACK, NAK if busy |
//! | set revolutions  | `V00012.50`         | ACK              |
//! | go               | `G`                 | ACK              |
//! | halt             | `H`                 | ACK              |
//! | local control    | `L`                 | ACK              |
//!
//! A bare ENQ on the line is answered with `?` by any pump still waiting
//! for an address.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

use crate::config::defaults::{PUMP_MAX_ADDRESS, PUMP_MAX_RPM, PUMP_MIN_RPM};
use crate::types::Direction;

pub const STX: u8 = 0x02;
pub const CR: u8 = 0x0D;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Largest revolution count the 8-character field can carry.
pub const MAX_REVOLUTIONS: f64 = 99_999.99;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PumpCommand {
    AssignAddress,
    RequestStatus,
    SetSpeed { direction: Direction, rpm: f64 },
    SetRevolutions(f64),
    Go,
    Halt,
    LocalControl,
}

impl PumpCommand {
    /// Message body after the `P<nn>` prefix.
    fn body(&self) -> String {
        match self {
            Self::AssignAddress => String::new(),
            Self::RequestStatus => "I".to_string(),
            Self::SetSpeed { direction, rpm } => {
                let sign = match direction {
                    Direction::Clockwise => '+',
                    Direction::CounterClockwise => '-',
                };
                format!("S{sign}{rpm:05.1}")
            }
            Self::SetRevolutions(rev) => format!("V{rev:08.2}"),
            Self::Go => "G".to_string(),
            Self::Halt => "H".to_string(),
            Self::LocalControl => "L".to_string(),
        }
    }

    /// Full frame for the pump at `address`.
    pub fn frame(&self, address: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(16);
        frame.push(STX);
        frame.extend_from_slice(format!("P{address:02}{}", self.body()).as_bytes());
        frame.push(CR);
        frame
    }

    /// Printable form for logs and errors.
    pub fn describe(&self, address: u8) -> String {
        format!("P{address:02}{}", self.body())
    }
}

/// Check an address is usable on the chain.
pub fn validate_address(address: u8) -> Result<u8, String> {
    if (1..=PUMP_MAX_ADDRESS).contains(&address) {
        Ok(address)
    } else {
        Err(format!("pump address must be 1..={PUMP_MAX_ADDRESS} (got {address})"))
    }
}

/// Check and round a head speed to the drive's 0.1 rpm resolution.
pub fn validate_rpm(rpm: f64) -> Result<f64, String> {
    if !(PUMP_MIN_RPM..=PUMP_MAX_RPM).contains(&rpm) {
        return Err(format!(
            "speed must be {PUMP_MIN_RPM}..={PUMP_MAX_RPM} rpm (got {rpm})"
        ));
    }
    Ok((rpm * 10.0).round() / 10.0)
}

/// Truncate a revolution count to the field's 0.01 resolution. Never rounds
/// up, so the drive turns at most what was asked.
pub fn floor_revolutions(rev: f64) -> f64 {
    ((rev * 100.0) + 1e-6).floor() / 100.0
}

/// Truncate a revolution count to the field's resolution and range-check it.
pub fn revolutions_field(rev: f64) -> Result<f64, String> {
    if !rev.is_finite() || rev < 0.0 {
        return Err(format!("revolutions must be a non-negative number (got {rev})"));
    }
    let floored = floor_revolutions(rev);
    if floored > MAX_REVOLUTIONS {
        return Err(format!(
            "{floored} revolutions exceeds the {MAX_REVOLUTIONS} per-command limit"
        ));
    }
    Ok(floored)
}

// ============================================================================
// Replies
// ============================================================================

/// Decoded reply bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak,
    Status(DeviceStatus),
    /// `?` in an ENQ reply: a pump is waiting for an address
    AddressRequest,
    Other(String),
}

impl Reply {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.contains(&NAK) {
            return Self::Nak;
        }
        let text = String::from_utf8_lossy(bytes);
        if let Some(status) = DeviceStatus::parse(&text) {
            return Self::Status(status);
        }
        if bytes.contains(&ACK) {
            return Self::Ack;
        }
        if text.contains('?') {
            return Self::AddressRequest;
        }
        Self::Other(printable(bytes))
    }
}

/// Render control characters so replies can be logged.
pub fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| match *b {
            STX => "<STX>".to_string(),
            CR => "<CR>".to_string(),
            ACK => "<ACK>".to_string(),
            NAK => "<NAK>".to_string(),
            ENQ => "<ENQ>".to_string(),
            b if b.is_ascii_graphic() || b == b' ' => (b as char).to_string(),
            b => format!("<{b:02X}>"),
        })
        .collect()
}

// ============================================================================
// Status Word
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorStatus {
    Idle,
    WaitingGo,
    Running,
    StoppedLocally,
    NoMotorFeedback,
    Overload,
    ExcessiveMotorFeedback,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PumpFault {
    None,
    Parity,
    Framing,
    Overrun,
    InvalidCommand,
    InvalidData,
    Unknown(u8),
}

/// Five-digit status word: control mode, two reserved digits, motor status, error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub control: ControlMode,
    pub motor: MotorStatus,
    pub fault: PumpFault,
}

fn status_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]{5}").ok()).as_ref()
}

impl DeviceStatus {
    /// Find and decode the first five-digit group in `reply`.
    pub fn parse(reply: &str) -> Option<Self> {
        let digits: Vec<u8> = status_regex()?
            .find(reply)?
            .as_str()
            .bytes()
            .map(|b| b - b'0')
            .collect();

        let control = match digits[0] {
            0 => ControlMode::Local,
            _ => ControlMode::Remote,
        };
        let motor = match digits[3] {
            1 => MotorStatus::Idle,
            2 => MotorStatus::WaitingGo,
            3 => MotorStatus::Running,
            4 => MotorStatus::StoppedLocally,
            5 => MotorStatus::NoMotorFeedback,
            6 => MotorStatus::Overload,
            7 => MotorStatus::ExcessiveMotorFeedback,
            other => MotorStatus::Unknown(other),
        };
        let fault = match digits[4] {
            0 => PumpFault::None,
            1 => PumpFault::Parity,
            2 => PumpFault::Framing,
            3 => PumpFault::Overrun,
            4 => PumpFault::InvalidCommand,
            5 => PumpFault::InvalidData,
            other => PumpFault::Unknown(other),
        };
        Some(Self {
            control,
            motor,
            fault,
        })
    }

    /// True if the drive reports a condition that makes dispensing unsafe.
    pub fn is_faulted(&self) -> bool {
        matches!(
            self.motor,
            MotorStatus::NoMotorFeedback | MotorStatus::Overload | MotorStatus::ExcessiveMotorFeedback
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.control, self.motor, self.fault)
    }
}
