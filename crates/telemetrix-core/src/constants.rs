//! Wire constants for the Telemetrix serial protocol.
//!
//! Every frame exchanged with the firmware, in either direction, has the same
//! self-delimiting shape:
//!
//! ```text
//! [length][type][payload...]
//!    ^      ^
//!    │      └── command opcode (host → board) or report type (board → host)
//!    └── number of bytes that follow the length byte (type + payload)
//! ```
//!
//! There is no start marker and no checksum. The decoder relies on the
//! per-report-type length table below to reject implausible headers and
//! resynchronize after corruption.
//!
//! # Usage
//!
//! ```
//! use telemetrix_core::constants::*;
//!
//! // A digital write of pin 13 high is four bytes on the wire
//! let frame = [3, DIGITAL_WRITE, 13, 1];
//! assert_eq!(frame[0] as usize, frame.len() - 1);
//! ```

// ============================================================================
// Command Opcodes (host → board)
// ============================================================================

/// Echo a single byte back as a [`REPORT_LOOP_BACK`] report.
pub const LOOP_BACK: u8 = 0;

/// Configure a pin for digital input/output, pull-up input or analog input.
pub const SET_PIN_MODE: u8 = 1;

/// Drive a digital output pin high or low.
pub const DIGITAL_WRITE: u8 = 2;

/// Write a 16-bit PWM value to an output pin.
pub const ANALOG_WRITE: u8 = 3;

/// Enable or disable reporting for a pin, or disable all reporting.
pub const MODIFY_REPORTING: u8 = 4;

/// Request a [`REPORT_FIRMWARE_VERSION`] reply.
pub const GET_FIRMWARE_VERSION: u8 = 5;

/// Request a [`REPORT_I_AM_HERE`] reply carrying the board instance id.
pub const ARE_YOU_THERE: u8 = 6;

/// Attach a servo to a pin with min/max pulse widths.
pub const SERVO_ATTACH: u8 = 7;

/// Move an attached servo to an angle.
pub const SERVO_WRITE: u8 = 8;

/// Detach a servo, releasing its slot on the board.
pub const SERVO_DETACH: u8 = 9;

/// Initialize an I2C port.
pub const I2C_BEGIN: u8 = 10;

/// Request a read from an I2C device.
pub const I2C_READ: u8 = 11;

/// Write bytes to an I2C device.
pub const I2C_WRITE: u8 = 12;

/// Attach an HC-SR04 style sonar.
pub const SONAR_NEW: u8 = 13;

/// Attach a DHT temperature/humidity sensor.
pub const DHT_NEW: u8 = 14;

/// Stop every periodic report on the board.
pub const STOP_ALL_REPORTS: u8 = 15;

/// Set the analog input scan interval in milliseconds.
pub const SET_ANALOG_SCAN_INTERVAL: u8 = 16;

/// Resume every periodic report on the board.
pub const ENABLE_ALL_REPORTS: u8 = 17;

/// Reset the firmware's pin and feature tables.
pub const RESET: u8 = 18;

// ============================================================================
// Report Types (board → host)
// ============================================================================

pub const REPORT_LOOP_BACK: u8 = 0;
pub const REPORT_FIRMWARE_VERSION: u8 = 1;
pub const REPORT_DIGITAL: u8 = 2;
pub const REPORT_ANALOG: u8 = 3;
pub const REPORT_I_AM_HERE: u8 = 6;
pub const REPORT_SERVO_UNAVAILABLE: u8 = 7;
pub const REPORT_I2C_TOO_FEW_BYTES: u8 = 8;
pub const REPORT_I2C_TOO_MANY_BYTES: u8 = 9;
pub const REPORT_I2C_READ: u8 = 10;
pub const REPORT_SONAR_DISTANCE: u8 = 11;
pub const REPORT_DHT: u8 = 12;
pub const REPORT_DEBUG_PRINT: u8 = 99;

// ============================================================================
// MODIFY_REPORTING Actions
// ============================================================================

pub const REPORTING_DISABLE_ALL: u8 = 0;
pub const REPORTING_ANALOG_ENABLE: u8 = 1;
pub const REPORTING_DIGITAL_ENABLE: u8 = 2;
pub const REPORTING_ANALOG_DISABLE: u8 = 3;
pub const REPORTING_DIGITAL_DISABLE: u8 = 4;

// ============================================================================
// DHT Report Subtypes
// ============================================================================

/// DHT report carrying humidity and temperature.
pub const DHT_DATA: u8 = 0;

/// DHT report carrying a sensor error code.
pub const DHT_ERROR: u8 = 1;

// ============================================================================
// Limits
// ============================================================================

/// Largest I2C transfer the firmware buffers (Arduino `Wire` buffer size).
pub const MAX_I2C_DATA: usize = 32;

/// Fixed bytes of an I2C read report ahead of the data: type, port, count,
/// address, register.
pub const I2C_READ_HEADER_LEN: usize = 5;

/// Largest `length` byte any report can legitimately carry.
pub const MAX_REPORT_LENGTH: usize = I2C_READ_HEADER_LEN + MAX_I2C_DATA;

/// Number of sonars the firmware can track.
pub const MAX_SONARS: usize = 6;

/// Number of DHT sensors the firmware can track.
pub const MAX_DHTS: usize = 6;

/// Number of I2C ports (0 = primary, 1 = secondary).
pub const I2C_PORT_COUNT: u8 = 2;

/// Largest servo angle in degrees.
pub const MAX_SERVO_ANGLE: u8 = 180;

/// Default servo pulse range in microseconds.
pub const DEFAULT_SERVO_MIN_PULSE: u16 = 544;
pub const DEFAULT_SERVO_MAX_PULSE: u16 = 2400;

// ============================================================================
// Session Defaults
// ============================================================================

/// Digital pin capacity of an Arduino Uno class board.
pub const DEFAULT_PIN_CAPACITY: u8 = 20;

/// Analog pin capacity of an Arduino Uno class board.
pub const DEFAULT_ANALOG_PIN_CAPACITY: u8 = 6;

/// Default wait for a synchronous-style reply (milliseconds).
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 1000;

/// TCP port the WiFi firmware variant listens on.
pub const DEFAULT_TCP_PORT: u16 = 31335;
