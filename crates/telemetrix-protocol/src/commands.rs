//! Outgoing commands (host → board).
//!
//! A [`Command`] is an opcode plus its ordered argument bytes. It is built
//! per call through the named constructors below, which lay the arguments
//! out exactly as the firmware expects, and is immutable afterwards.
//!
//! # Wire Format
//!
//! ```text
//! [length][opcode][args...]      length = 1 + args.len()
//! ```
//!
//! # Examples
//!
//! ```
//! use telemetrix_protocol::{Command, CommandCode};
//!
//! let cmd = Command::digital_write(13, true);
//! assert_eq!(cmd.code(), CommandCode::DigitalWrite);
//! assert_eq!(&cmd.to_bytes()[..], &[3, 2, 13, 1]);
//! ```
//!
//! Board-capacity checks (is pin 25 valid on this board?) belong to the
//! session; constructors here only enforce what the wire format itself
//! cannot represent.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use telemetrix_core::constants::{self, MAX_I2C_DATA};
use telemetrix_core::{Error, FrameErrorKind, PinMode, Result};

use crate::frame::{LengthRule, WireFrame, check_length, put_frame};

/// Command opcodes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCode {
    LoopBack,
    SetPinMode,
    DigitalWrite,
    AnalogWrite,
    ModifyReporting,
    GetFirmwareVersion,
    AreYouThere,
    ServoAttach,
    ServoWrite,
    ServoDetach,
    I2cBegin,
    I2cRead,
    I2cWrite,
    SonarNew,
    DhtNew,
    StopAllReports,
    SetAnalogScanInterval,
    EnableAllReports,
    Reset,
}

impl CommandCode {
    /// Opcode byte on the wire.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::LoopBack => constants::LOOP_BACK,
            Self::SetPinMode => constants::SET_PIN_MODE,
            Self::DigitalWrite => constants::DIGITAL_WRITE,
            Self::AnalogWrite => constants::ANALOG_WRITE,
            Self::ModifyReporting => constants::MODIFY_REPORTING,
            Self::GetFirmwareVersion => constants::GET_FIRMWARE_VERSION,
            Self::AreYouThere => constants::ARE_YOU_THERE,
            Self::ServoAttach => constants::SERVO_ATTACH,
            Self::ServoWrite => constants::SERVO_WRITE,
            Self::ServoDetach => constants::SERVO_DETACH,
            Self::I2cBegin => constants::I2C_BEGIN,
            Self::I2cRead => constants::I2C_READ,
            Self::I2cWrite => constants::I2C_WRITE,
            Self::SonarNew => constants::SONAR_NEW,
            Self::DhtNew => constants::DHT_NEW,
            Self::StopAllReports => constants::STOP_ALL_REPORTS,
            Self::SetAnalogScanInterval => constants::SET_ANALOG_SCAN_INTERVAL,
            Self::EnableAllReports => constants::ENABLE_ALL_REPORTS,
            Self::Reset => constants::RESET,
        }
    }

    /// Parse an opcode byte.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        let code = match byte {
            constants::LOOP_BACK => Self::LoopBack,
            constants::SET_PIN_MODE => Self::SetPinMode,
            constants::DIGITAL_WRITE => Self::DigitalWrite,
            constants::ANALOG_WRITE => Self::AnalogWrite,
            constants::MODIFY_REPORTING => Self::ModifyReporting,
            constants::GET_FIRMWARE_VERSION => Self::GetFirmwareVersion,
            constants::ARE_YOU_THERE => Self::AreYouThere,
            constants::SERVO_ATTACH => Self::ServoAttach,
            constants::SERVO_WRITE => Self::ServoWrite,
            constants::SERVO_DETACH => Self::ServoDetach,
            constants::I2C_BEGIN => Self::I2cBegin,
            constants::I2C_READ => Self::I2cRead,
            constants::I2C_WRITE => Self::I2cWrite,
            constants::SONAR_NEW => Self::SonarNew,
            constants::DHT_NEW => Self::DhtNew,
            constants::STOP_ALL_REPORTS => Self::StopAllReports,
            constants::SET_ANALOG_SCAN_INTERVAL => Self::SetAnalogScanInterval,
            constants::ENABLE_ALL_REPORTS => Self::EnableAllReports,
            constants::RESET => Self::Reset,
            _ => return None,
        };
        Some(code)
    }

    /// Lengths (opcode + arguments) a frame with this opcode may declare.
    #[must_use]
    pub fn length_rule(&self) -> LengthRule {
        match self {
            Self::GetFirmwareVersion
            | Self::AreYouThere
            | Self::StopAllReports
            | Self::EnableAllReports
            | Self::Reset => LengthRule::Exact(1),
            Self::LoopBack
            | Self::ServoDetach
            | Self::I2cBegin
            | Self::DhtNew
            | Self::SetAnalogScanInterval => LengthRule::Exact(2),
            Self::DigitalWrite | Self::ModifyReporting | Self::ServoWrite | Self::SonarNew => {
                LengthRule::Exact(3)
            }
            Self::AnalogWrite => LengthRule::Exact(4),
            Self::ServoAttach | Self::I2cRead => LengthRule::Exact(6),
            Self::SetPinMode => LengthRule::OneOf(&[3, 4, 6]),
            Self::I2cWrite => LengthRule::Range {
                min: 4,
                max: 4 + MAX_I2C_DATA as u8,
            },
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// Action byte of a `MODIFY_REPORTING` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportingAction {
    DisableAll,
    AnalogEnable,
    DigitalEnable,
    AnalogDisable,
    DigitalDisable,
}

impl ReportingAction {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::DisableAll => constants::REPORTING_DISABLE_ALL,
            Self::AnalogEnable => constants::REPORTING_ANALOG_ENABLE,
            Self::DigitalEnable => constants::REPORTING_DIGITAL_ENABLE,
            Self::AnalogDisable => constants::REPORTING_ANALOG_DISABLE,
            Self::DigitalDisable => constants::REPORTING_DIGITAL_DISABLE,
        }
    }
}

/// An outgoing command frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    code: CommandCode,
    args: Vec<u8>,
}

impl Command {
    /// Build a command from raw argument bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the argument count is not one the
    /// opcode can carry.
    pub fn new(code: CommandCode, args: Vec<u8>) -> Result<Self> {
        let length = u8::try_from(args.len() + 1)
            .map_err(|_| Error::InvalidArgument(format!("{code} has too many arguments")))?;
        if !code.length_rule().accepts(length) {
            return Err(Error::InvalidArgument(format!(
                "{code} cannot carry {} argument byte(s)",
                args.len()
            )));
        }
        Ok(Self { code, args })
    }

    fn fixed(code: CommandCode, args: &[u8]) -> Self {
        debug_assert!(code.length_rule().accepts((args.len() + 1) as u8));
        Self {
            code,
            args: args.to_vec(),
        }
    }

    #[must_use]
    pub fn code(&self) -> CommandCode {
        self.code
    }

    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Total bytes on the wire, including the length prefix.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.args.len() + 2
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_frame(dst, self.code.as_u8(), &self.args);
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut dst);
        dst.freeze()
    }

    // ------------------------------------------------------------------
    // Constructors, one per command family
    // ------------------------------------------------------------------

    #[must_use]
    pub fn loop_back(byte: u8) -> Self {
        Self::fixed(CommandCode::LoopBack, &[byte])
    }

    /// Configure a pin. `differential` is only sent for analog inputs: the
    /// minimum change between two readings that triggers a report.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for feature modes (servo, sonar,
    /// DHT, I2C), which have their own attach commands.
    pub fn set_pin_mode(pin: u8, mode: PinMode, differential: u16) -> Result<Self> {
        let code = mode.wire_code().ok_or_else(|| {
            Error::InvalidArgument(format!("{mode} is not set through SET_PIN_MODE"))
        })?;
        let command = match mode {
            PinMode::DigitalOutput => Self::fixed(CommandCode::SetPinMode, &[pin, code]),
            PinMode::AnalogInput => {
                let [hi, lo] = differential.to_be_bytes();
                Self::fixed(CommandCode::SetPinMode, &[pin, code, hi, lo, 1])
            }
            _ => Self::fixed(CommandCode::SetPinMode, &[pin, code, 1]),
        };
        Ok(command)
    }

    #[must_use]
    pub fn digital_write(pin: u8, high: bool) -> Self {
        Self::fixed(CommandCode::DigitalWrite, &[pin, u8::from(high)])
    }

    #[must_use]
    pub fn analog_write(pin: u8, value: u16) -> Self {
        let [hi, lo] = value.to_be_bytes();
        Self::fixed(CommandCode::AnalogWrite, &[pin, hi, lo])
    }

    #[must_use]
    pub fn modify_reporting(action: ReportingAction, pin: u8) -> Self {
        Self::fixed(CommandCode::ModifyReporting, &[action.as_u8(), pin])
    }

    #[must_use]
    pub fn get_firmware_version() -> Self {
        Self::fixed(CommandCode::GetFirmwareVersion, &[])
    }

    #[must_use]
    pub fn are_you_there() -> Self {
        Self::fixed(CommandCode::AreYouThere, &[])
    }

    #[must_use]
    pub fn servo_attach(pin: u8, min_pulse: u16, max_pulse: u16) -> Self {
        let [min_hi, min_lo] = min_pulse.to_be_bytes();
        let [max_hi, max_lo] = max_pulse.to_be_bytes();
        Self::fixed(
            CommandCode::ServoAttach,
            &[pin, min_hi, min_lo, max_hi, max_lo],
        )
    }

    #[must_use]
    pub fn servo_write(pin: u8, angle: u8) -> Self {
        Self::fixed(CommandCode::ServoWrite, &[pin, angle])
    }

    #[must_use]
    pub fn servo_detach(pin: u8) -> Self {
        Self::fixed(CommandCode::ServoDetach, &[pin])
    }

    #[must_use]
    pub fn i2c_begin(port: u8) -> Self {
        Self::fixed(CommandCode::I2cBegin, &[port])
    }

    #[must_use]
    pub fn i2c_read(address: u8, register: u8, count: u8, stop_transmission: bool, port: u8) -> Self {
        Self::fixed(
            CommandCode::I2cRead,
            &[address, register, count, u8::from(stop_transmission), port],
        )
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `data` is empty or longer than
    /// the firmware's I2C buffer.
    pub fn i2c_write(address: u8, port: u8, data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() > MAX_I2C_DATA {
            return Err(Error::InvalidArgument(format!(
                "I2C write must carry 1-{MAX_I2C_DATA} bytes, got {}",
                data.len()
            )));
        }
        let mut args = Vec::with_capacity(data.len() + 3);
        args.extend_from_slice(&[data.len() as u8, address, port]);
        args.extend_from_slice(data);
        Ok(Self {
            code: CommandCode::I2cWrite,
            args,
        })
    }

    #[must_use]
    pub fn sonar_new(trigger_pin: u8, echo_pin: u8) -> Self {
        Self::fixed(CommandCode::SonarNew, &[trigger_pin, echo_pin])
    }

    #[must_use]
    pub fn dht_new(pin: u8) -> Self {
        Self::fixed(CommandCode::DhtNew, &[pin])
    }

    #[must_use]
    pub fn stop_all_reports() -> Self {
        Self::fixed(CommandCode::StopAllReports, &[])
    }

    #[must_use]
    pub fn set_analog_scan_interval(interval_ms: u8) -> Self {
        Self::fixed(CommandCode::SetAnalogScanInterval, &[interval_ms])
    }

    #[must_use]
    pub fn enable_all_reports() -> Self {
        Self::fixed(CommandCode::EnableAllReports, &[])
    }

    #[must_use]
    pub fn reset() -> Self {
        Self::fixed(CommandCode::Reset, &[])
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.code, self.args)
    }
}

impl WireFrame for Command {
    fn check_header(type_byte: u8, length: u8) -> std::result::Result<(), FrameErrorKind> {
        check_length(
            type_byte,
            length,
            CommandCode::from_u8(type_byte).map(|code| code.length_rule()),
        )
    }

    fn from_wire(type_byte: u8, payload: &[u8]) -> std::result::Result<Self, FrameErrorKind> {
        let code =
            CommandCode::from_u8(type_byte).ok_or(FrameErrorKind::UnknownReportType(type_byte))?;
        if code == CommandCode::I2cWrite && usize::from(payload[0]) != payload.len() - 3 {
            return Err(FrameErrorKind::MalformedPayload {
                report_type: type_byte,
                reason: "I2C write count does not match data length",
            });
        }
        Ok(Self {
            code,
            args: payload.to_vec(),
        })
    }
}
