//! Incoming reports (board → host).
//!
//! The decoder produces [`ReportFrame`]s: a report type plus its raw payload.
//! [`Report`] is the typed view the dispatcher works with. A frame only
//! leaves the [`StreamParser`](crate::StreamParser) once its payload decodes,
//! so converting an emitted frame to a `Report` does not fail in practice.
//!
//! # Payload Layouts
//!
//! | Report | Payload |
//! |--------|---------|
//! | LoopBack | `char` |
//! | FirmwareVersion | `major, minor` |
//! | Digital | `pin, value` |
//! | Analog | `pin, value_hi, value_lo` |
//! | IAmHere | `instance_id` |
//! | ServoUnavailable | `pin` |
//! | I2cTooFewBytes / I2cTooManyBytes | `port, address` |
//! | I2cRead | `port, count, address, register, data[count]` |
//! | SonarDistance | `trigger_pin, cm_hi, cm_lo` |
//! | Dht | `0, pin, humidity f32 LE, temperature f32 LE` or `1, pin, error` |
//! | DebugPrint | `id, value_hi, value_lo` |

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use telemetrix_core::constants::{self, I2C_READ_HEADER_LEN, MAX_I2C_DATA, MAX_REPORT_LENGTH};
use telemetrix_core::{FirmwareVersion, FrameErrorKind};

use crate::frame::{LengthRule, WireFrame, check_length, put_frame};

/// Report types the firmware emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    LoopBack,
    FirmwareVersion,
    Digital,
    Analog,
    IAmHere,
    ServoUnavailable,
    I2cTooFewBytes,
    I2cTooManyBytes,
    I2cRead,
    SonarDistance,
    Dht,
    DebugPrint,
}

impl ReportType {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::LoopBack => constants::REPORT_LOOP_BACK,
            Self::FirmwareVersion => constants::REPORT_FIRMWARE_VERSION,
            Self::Digital => constants::REPORT_DIGITAL,
            Self::Analog => constants::REPORT_ANALOG,
            Self::IAmHere => constants::REPORT_I_AM_HERE,
            Self::ServoUnavailable => constants::REPORT_SERVO_UNAVAILABLE,
            Self::I2cTooFewBytes => constants::REPORT_I2C_TOO_FEW_BYTES,
            Self::I2cTooManyBytes => constants::REPORT_I2C_TOO_MANY_BYTES,
            Self::I2cRead => constants::REPORT_I2C_READ,
            Self::SonarDistance => constants::REPORT_SONAR_DISTANCE,
            Self::Dht => constants::REPORT_DHT,
            Self::DebugPrint => constants::REPORT_DEBUG_PRINT,
        }
    }

    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        let report_type = match byte {
            constants::REPORT_LOOP_BACK => Self::LoopBack,
            constants::REPORT_FIRMWARE_VERSION => Self::FirmwareVersion,
            constants::REPORT_DIGITAL => Self::Digital,
            constants::REPORT_ANALOG => Self::Analog,
            constants::REPORT_I_AM_HERE => Self::IAmHere,
            constants::REPORT_SERVO_UNAVAILABLE => Self::ServoUnavailable,
            constants::REPORT_I2C_TOO_FEW_BYTES => Self::I2cTooFewBytes,
            constants::REPORT_I2C_TOO_MANY_BYTES => Self::I2cTooManyBytes,
            constants::REPORT_I2C_READ => Self::I2cRead,
            constants::REPORT_SONAR_DISTANCE => Self::SonarDistance,
            constants::REPORT_DHT => Self::Dht,
            constants::REPORT_DEBUG_PRINT => Self::DebugPrint,
            _ => return None,
        };
        Some(report_type)
    }

    /// Lengths (type + payload) a frame of this type may declare.
    #[must_use]
    pub fn length_rule(&self) -> LengthRule {
        match self {
            Self::LoopBack | Self::IAmHere | Self::ServoUnavailable => LengthRule::Exact(2),
            Self::FirmwareVersion
            | Self::Digital
            | Self::I2cTooFewBytes
            | Self::I2cTooManyBytes => LengthRule::Exact(3),
            Self::Analog | Self::SonarDistance | Self::DebugPrint => LengthRule::Exact(4),
            Self::Dht => LengthRule::OneOf(&[4, 11]),
            Self::I2cRead => LengthRule::Range {
                min: I2C_READ_HEADER_LEN as u8,
                max: MAX_REPORT_LENGTH as u8,
            },
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// A complete incoming frame: report type plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportFrame {
    report_type: ReportType,
    payload: Bytes,
}

impl ReportFrame {
    /// Build a frame, validating that the payload decodes.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason if the payload is not a valid body for
    /// `report_type`.
    pub fn new(report_type: ReportType, payload: impl Into<Bytes>) -> Result<Self, FrameErrorKind> {
        let payload = payload.into();
        let type_byte = report_type.as_u8();
        Self::check_header(type_byte, (payload.len() + 1).min(u8::MAX as usize) as u8)?;
        Self::from_wire(type_byte, &payload)
    }

    #[must_use]
    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total bytes on the wire, including the length prefix.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.payload.len() + 2
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_frame(dst, self.report_type.as_u8(), &self.payload);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Typed view of the frame.
    ///
    /// # Errors
    ///
    /// Only fails for frames built around the validating constructors.
    pub fn report(&self) -> Result<Report, FrameErrorKind> {
        Report::decode(self.report_type, &self.payload)
    }
}

impl WireFrame for ReportFrame {
    fn check_header(type_byte: u8, length: u8) -> Result<(), FrameErrorKind> {
        check_length(
            type_byte,
            length,
            ReportType::from_u8(type_byte).map(|t| t.length_rule()),
        )
    }

    fn from_wire(type_byte: u8, payload: &[u8]) -> Result<Self, FrameErrorKind> {
        let report_type =
            ReportType::from_u8(type_byte).ok_or(FrameErrorKind::UnknownReportType(type_byte))?;
        Report::decode(report_type, payload)?;
        Ok(Self {
            report_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// A DHT reading or sensor error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DhtReading {
    Data { humidity: f32, temperature: f32 },
    Error(u8),
}

/// Typed incoming report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Report {
    LoopBack(u8),
    FirmwareVersion(FirmwareVersion),
    Digital { pin: u8, value: u8 },
    Analog { pin: u8, value: u16 },
    IAmHere { instance_id: u8 },
    ServoUnavailable { pin: u8 },
    I2cTooFewBytes { port: u8, address: u8 },
    I2cTooManyBytes { port: u8, address: u8 },
    I2cRead {
        port: u8,
        address: u8,
        register: u8,
        data: Vec<u8>,
    },
    SonarDistance { trigger_pin: u8, distance_cm: u16 },
    Dht { pin: u8, reading: DhtReading },
    DebugPrint { id: u8, value: u16 },
}

fn malformed(report_type: ReportType, reason: &'static str) -> FrameErrorKind {
    FrameErrorKind::MalformedPayload {
        report_type: report_type.as_u8(),
        reason,
    }
}

fn be16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

impl Report {
    /// Decode a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns `LengthMismatch` or `MalformedPayload` when the bytes are not
    /// a valid body for `report_type`.
    pub fn decode(report_type: ReportType, payload: &[u8]) -> Result<Self, FrameErrorKind> {
        let length = payload.len() + 1;
        if length > u8::MAX as usize || !report_type.length_rule().accepts(length as u8) {
            return Err(FrameErrorKind::LengthMismatch {
                report_type: report_type.as_u8(),
                length: length.min(u8::MAX as usize) as u8,
            });
        }

        let report = match (report_type, payload) {
            (ReportType::LoopBack, &[byte]) => Self::LoopBack(byte),
            (ReportType::FirmwareVersion, &[major, minor]) => {
                Self::FirmwareVersion(FirmwareVersion::new(major, minor))
            }
            (ReportType::Digital, &[pin, value]) => {
                if value > 1 {
                    return Err(malformed(report_type, "digital level must be 0 or 1"));
                }
                Self::Digital { pin, value }
            }
            (ReportType::Analog, &[pin, hi, lo]) => Self::Analog {
                pin,
                value: be16(hi, lo),
            },
            (ReportType::IAmHere, &[instance_id]) => Self::IAmHere { instance_id },
            (ReportType::ServoUnavailable, &[pin]) => Self::ServoUnavailable { pin },
            (ReportType::I2cTooFewBytes, &[port, address]) => Self::I2cTooFewBytes { port, address },
            (ReportType::I2cTooManyBytes, &[port, address]) => {
                Self::I2cTooManyBytes { port, address }
            }
            (ReportType::I2cRead, &[port, count, address, register, ref data @ ..]) => {
                if usize::from(count) != data.len() {
                    return Err(malformed(report_type, "I2C byte count does not match data"));
                }
                Self::I2cRead {
                    port,
                    address,
                    register,
                    data: data.to_vec(),
                }
            }
            (ReportType::SonarDistance, &[trigger_pin, hi, lo]) => Self::SonarDistance {
                trigger_pin,
                distance_cm: be16(hi, lo),
            },
            (ReportType::Dht, &[constants::DHT_ERROR, pin, code]) => Self::Dht {
                pin,
                reading: DhtReading::Error(code),
            },
            (
                ReportType::Dht,
                &[constants::DHT_DATA, pin, h0, h1, h2, h3, t0, t1, t2, t3],
            ) => Self::Dht {
                pin,
                reading: DhtReading::Data {
                    humidity: f32::from_le_bytes([h0, h1, h2, h3]),
                    temperature: f32::from_le_bytes([t0, t1, t2, t3]),
                },
            },
            (ReportType::Dht, _) => {
                return Err(malformed(report_type, "DHT subtype does not match length"));
            }
            (ReportType::DebugPrint, &[id, hi, lo]) => Self::DebugPrint {
                id,
                value: be16(hi, lo),
            },
            _ => return Err(malformed(report_type, "unexpected payload layout")),
        };
        Ok(report)
    }

    #[must_use]
    pub fn report_type(&self) -> ReportType {
        match self {
            Self::LoopBack(_) => ReportType::LoopBack,
            Self::FirmwareVersion(_) => ReportType::FirmwareVersion,
            Self::Digital { .. } => ReportType::Digital,
            Self::Analog { .. } => ReportType::Analog,
            Self::IAmHere { .. } => ReportType::IAmHere,
            Self::ServoUnavailable { .. } => ReportType::ServoUnavailable,
            Self::I2cTooFewBytes { .. } => ReportType::I2cTooFewBytes,
            Self::I2cTooManyBytes { .. } => ReportType::I2cTooManyBytes,
            Self::I2cRead { .. } => ReportType::I2cRead,
            Self::SonarDistance { .. } => ReportType::SonarDistance,
            Self::Dht { .. } => ReportType::Dht,
            Self::DebugPrint { .. } => ReportType::DebugPrint,
        }
    }

    /// Lay the report out as the firmware would send it.
    ///
    /// # Errors
    ///
    /// Fails for values the wire cannot carry: I2C data over 32 bytes or a
    /// digital level other than 0/1.
    pub fn to_frame(&self) -> Result<ReportFrame, FrameErrorKind> {
        let payload: Vec<u8> = match self {
            Self::LoopBack(byte) => vec![*byte],
            Self::FirmwareVersion(version) => vec![version.major, version.minor],
            Self::Digital { pin, value } => vec![*pin, *value],
            Self::Analog { pin, value } => {
                let [hi, lo] = value.to_be_bytes();
                vec![*pin, hi, lo]
            }
            Self::IAmHere { instance_id } => vec![*instance_id],
            Self::ServoUnavailable { pin } => vec![*pin],
            Self::I2cTooFewBytes { port, address } | Self::I2cTooManyBytes { port, address } => {
                vec![*port, *address]
            }
            Self::I2cRead {
                port,
                address,
                register,
                data,
            } => {
                if data.len() > MAX_I2C_DATA {
                    return Err(malformed(ReportType::I2cRead, "I2C data exceeds 32 bytes"));
                }
                let mut payload = vec![*port, data.len() as u8, *address, *register];
                payload.extend_from_slice(data);
                payload
            }
            Self::SonarDistance {
                trigger_pin,
                distance_cm,
            } => {
                let [hi, lo] = distance_cm.to_be_bytes();
                vec![*trigger_pin, hi, lo]
            }
            Self::Dht { pin, reading } => match reading {
                DhtReading::Error(code) => vec![constants::DHT_ERROR, *pin, *code],
                DhtReading::Data {
                    humidity,
                    temperature,
                } => {
                    let mut payload = vec![constants::DHT_DATA, *pin];
                    payload.extend_from_slice(&humidity.to_le_bytes());
                    payload.extend_from_slice(&temperature.to_le_bytes());
                    payload
                }
            },
            Self::DebugPrint { id, value } => {
                let [hi, lo] = value.to_be_bytes();
                vec![*id, hi, lo]
            }
        };
        ReportFrame::new(self.report_type(), payload)
    }
}
