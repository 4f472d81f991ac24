//! Session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetrix_core::constants::{
    DEFAULT_ANALOG_PIN_CAPACITY, DEFAULT_PIN_CAPACITY, DEFAULT_REPLY_TIMEOUT_MS,
};
use telemetrix_core::{Error, Result};

/// Configuration recognized at session start.
///
/// Durations serialize as integer milliseconds, and every field falls back to
/// its default when missing:
///
/// ```
/// use telemetrix_client::SessionConfig;
/// use std::time::Duration;
///
/// let config: SessionConfig =
///     serde_json::from_str(r#"{"pin_capacity": 54, "default_timeout": 250}"#).unwrap();
/// assert_eq!(config.pin_capacity, 54);
/// assert_eq!(config.default_timeout, Duration::from_millis(250));
/// assert_eq!(config.analog_pin_capacity, 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of digital pins on the board; valid pins are `0..pin_capacity`.
    pub pin_capacity: u8,

    /// Number of analog input pins; valid pins are `0..analog_pin_capacity`.
    pub analog_pin_capacity: u8,

    /// How long to wait for a reply, and for a command write to complete.
    #[serde(with = "millis")]
    pub default_timeout: Duration,

    /// Board instance id expected during the start handshake. `None` accepts
    /// any board.
    pub instance_id: Option<u8>,

    /// Pause before the start handshake, for boards that reset when the
    /// link opens.
    #[serde(with = "millis")]
    pub reset_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pin_capacity: DEFAULT_PIN_CAPACITY,
            analog_pin_capacity: DEFAULT_ANALOG_PIN_CAPACITY,
            default_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            instance_id: None,
            reset_wait: Duration::ZERO,
        }
    }
}

impl SessionConfig {
    /// Check that the configuration describes a usable session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a zero pin capacity or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.pin_capacity == 0 {
            return Err(Error::Config("pin_capacity must be at least 1".into()));
        }
        if self.analog_pin_capacity > self.pin_capacity {
            return Err(Error::Config(format!(
                "analog_pin_capacity {} exceeds pin_capacity {}",
                self.analog_pin_capacity, self.pin_capacity
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Config("default_timeout must be non-zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_pin_capacity(mut self, pin_capacity: u8) -> Self {
        self.pin_capacity = pin_capacity;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    #[must_use]
    pub fn with_reset_wait(mut self, reset_wait: Duration) -> Self {
        self.reset_wait = reset_wait;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
