use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Category of addressable ids on the board.
///
/// Ids are only unique within a space: digital pin 3 and analog pin 3 are
/// different things, and sonars are keyed by their trigger pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Space {
    /// Digital pins, numbered as on the board header.
    Digital,
    /// Analog input pins, `A0` = 0.
    Analog,
    /// Servo outputs, keyed by pin.
    Servo,
    /// Sonar sensors, keyed by trigger pin.
    Sonar,
    /// DHT sensors, keyed by data pin.
    Dht,
    /// I2C ports, keyed by port number.
    I2c,
    /// Loop-back echo, always id 0.
    LoopBack,
    /// Firmware version, always id 0.
    Firmware,
    /// Board instance id, always id 0.
    Board,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Digital => "digital",
            Self::Analog => "analog",
            Self::Servo => "servo",
            Self::Sonar => "sonar",
            Self::Dht => "dht",
            Self::I2c => "i2c",
            Self::LoopBack => "loop-back",
            Self::Firmware => "firmware",
            Self::Board => "board",
        };
        f.write_str(name)
    }
}

/// Identity of one pin or feature instance: `(space, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinKey {
    pub space: Space,
    pub id: u8,
}

impl PinKey {
    #[must_use]
    pub const fn new(space: Space, id: u8) -> Self {
        Self { space, id }
    }

    #[must_use]
    pub const fn digital(pin: u8) -> Self {
        Self::new(Space::Digital, pin)
    }

    #[must_use]
    pub const fn analog(pin: u8) -> Self {
        Self::new(Space::Analog, pin)
    }
}

impl fmt::Display for PinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.id)
    }
}

/// Configured mode of a pin or feature.
///
/// Only the first four modes are set through `SET_PIN_MODE`; the feature
/// modes are recorded when the matching attach command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinMode {
    DigitalInput,
    DigitalOutput,
    DigitalInputPullup,
    AnalogInput,
    Servo,
    Sonar,
    Dht,
    I2c,
}

impl PinMode {
    /// Wire code used by `SET_PIN_MODE`, or `None` for feature modes.
    #[must_use]
    pub fn wire_code(&self) -> Option<u8> {
        match self {
            Self::DigitalInput => Some(0),
            Self::DigitalOutput => Some(1),
            Self::DigitalInputPullup => Some(2),
            Self::AnalogInput => Some(3),
            Self::Servo | Self::Sonar | Self::Dht | Self::I2c => None,
        }
    }

    /// Space whose ids this mode addresses.
    #[must_use]
    pub fn space(&self) -> Space {
        match self {
            Self::DigitalInput | Self::DigitalOutput | Self::DigitalInputPullup => Space::Digital,
            Self::AnalogInput => Space::Analog,
            Self::Servo => Space::Servo,
            Self::Sonar => Space::Sonar,
            Self::Dht => Space::Dht,
            Self::I2c => Space::I2c,
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DigitalInput => "digital input",
            Self::DigitalOutput => "digital output",
            Self::DigitalInputPullup => "digital input (pull-up)",
            Self::AnalogInput => "analog input",
            Self::Servo => "servo",
            Self::Sonar => "sonar",
            Self::Dht => "dht",
            Self::I2c => "i2c",
        };
        f.write_str(name)
    }
}

/// Firmware version reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidArgument(format!("Invalid firmware version: {s}")))?;
        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|_| Error::InvalidArgument(format!("Invalid firmware version: {s}")))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

/// Last value reported for a pin or feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Digital level, 0 or 1.
    Digital(u8),
    /// Raw analog reading.
    Analog(u16),
    /// Sonar distance in centimeters.
    Distance(u16),
    /// DHT humidity (%) and temperature (°C).
    Dht { humidity: f32, temperature: f32 },
    /// DHT sensor error code.
    DhtError(u8),
    /// Bytes returned by an I2C read.
    I2c {
        address: u8,
        register: u8,
        data: Vec<u8>,
    },
    /// Byte echoed by the loop-back command.
    LoopBack(u8),
    /// Firmware version reply.
    Firmware(FirmwareVersion),
    /// Board instance id reply.
    InstanceId(u8),
}

impl Value {
    /// Numeric view of scalar values, used by simple consumers that only
    /// care about pin levels.
    #[must_use]
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::Digital(v) | Self::LoopBack(v) | Self::InstanceId(v) => Some(u16::from(*v)),
            Self::Analog(v) | Self::Distance(v) => Some(*v),
            _ => None,
        }
    }
}

/// Arrival stamp of a report.
///
/// `sequence` is strictly increasing across the whole session and defines
/// ordering; `received_at` is the wall-clock time the frame was decoded and
/// is informational only, since wall clocks may step backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timestamp {
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

impl Timestamp {
    #[must_use]
    pub fn now(sequence: u64) -> Self {
        Self {
            sequence,
            received_at: Utc::now(),
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}
