//! Command Engine.
//!
//! A [`Session`] owns one link to a board running Telemetrix firmware. It
//! validates every request against the session configuration before any
//! byte is written, serializes commands onto the transport and, for the two
//! queries that have an identifiable reply, waits for that reply through the
//! pending reply slots.
//!
//! # Architecture
//!
//! ```text
//! caller ──► Session ──► FramedWrite<TelemetrixCodec> ──► board
//!               │
//!               └── LoopContext ◄── read loop ◄── FramedRead ◄── board
//!                      │
//!                      ├─> ReportDispatcher ──> DeviceStateTable
//!                      │         └──> handlers
//!                      └─> PendingReplies
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use telemetrix_client::{Session, SessionConfig};
//! use telemetrix_core::{PinMode, Space};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect_tcp("192.168.2.50:31335".parse()?, SessionConfig::default()).await?;
//!
//! session.configure_pin_mode(13, PinMode::DigitalOutput).await?;
//! session.digital_write(13, 1).await?;
//!
//! session.register_callback(Space::Analog, 2, |event| {
//!     println!("A2 = {:?}", event.value);
//! });
//! session.configure_pin_mode(2, PinMode::AnalogInput).await?;
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Cancellation
//!
//! Dropping a query future before it completes releases its reply slot. The
//! command may already have been written; a reply that arrives afterwards
//! only updates the state table.

use futures::SinkExt;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use telemetrix_core::constants::{
    I2C_PORT_COUNT, MAX_DHTS, MAX_I2C_DATA, MAX_SERVO_ANGLE, MAX_SONARS,
};
use telemetrix_core::{Error, FirmwareVersion, PinKey, PinMode, Result, Space, Value};
use telemetrix_protocol::{Command, ReportingAction, TelemetrixCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::dispatcher::{Diagnostic, PinEvent, ReportDispatcher};
use crate::pending::{PendingReplies, ReplyKind};
use crate::read_loop::{self, LoopContext, LoopState};
use crate::state::{DeviceStateTable, StateEntry};

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, TelemetrixCodec>;

/// How long `close` waits for its farewell command and the transport
/// shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Feature instances attached on the board since the last reset.
#[derive(Debug, Default)]
struct Features {
    servos: BTreeSet<u8>,
    sonars: BTreeSet<u8>,
    dhts: BTreeSet<u8>,
    i2c_ports: BTreeSet<u8>,
}

struct Shared {
    config: SessionConfig,
    writer: AsyncMutex<Option<Writer>>,
    ctx: Arc<LoopContext>,
    state: Arc<DeviceStateTable>,
    reader: Mutex<Option<JoinHandle<()>>>,
    features: Mutex<Features>,
}

impl Shared {
    fn features(&self) -> MutexGuard<'_, Features> {
        self.features.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn stop(&self, reason: &str) {
        self.abort_reader();
        self.ctx.stop(reason);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Host-side session with one board.
///
/// Cheap to clone; every clone drives the same link. Commands from
/// concurrent callers are written one whole frame at a time.
///
/// Dropping the last clone stops the read loop. A handler that captures a
/// clone keeps the session alive until [`Session::close`] runs, which drops
/// every registered handler.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.shared.config)
            .field("loop_state", &self.loop_state())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach to an already open transport and start the read loop.
    ///
    /// No bytes are exchanged; use [`Session::start`] for the full board
    /// handshake. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` does not validate.
    pub async fn connect<T>(transport: T, config: SessionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = tokio::io::split(transport);
        let state = Arc::new(DeviceStateTable::new());
        let pending = Arc::new(PendingReplies::new());
        let dispatcher = ReportDispatcher::new(state.clone(), pending.clone());
        let ctx = Arc::new(LoopContext::new(dispatcher, pending));
        let handle = read_loop::spawn(reader, ctx.clone());

        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        info!(
            pin_capacity = config.pin_capacity,
            analog_pin_capacity = config.analog_pin_capacity,
            "Session connected"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                writer: AsyncMutex::new(Some(FramedWrite::new(writer, TelemetrixCodec::new()))),
                ctx,
                state,
                reader: Mutex::new(Some(handle)),
                features: Mutex::new(Features::default()),
            }),
        })
    }

    /// Connect and bring the board to a known state.
    ///
    /// After the optional `reset_wait` pause the board is asked to identify
    /// itself and its instance id is checked against the configuration. The
    /// firmware version is then queried, reporting is re-enabled and the
    /// board is reset. The session is closed if any step fails.
    ///
    /// # Errors
    ///
    /// - `Handshake` if the board reports a different instance id
    /// - `Timeout` if the board does not answer
    /// - any error from the commands sent along the way
    pub async fn start<T>(transport: T, config: SessionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Self::connect(transport, config).await?;
        match session.handshake().await {
            Ok(version) => {
                info!(%version, "Board ready");
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Start handshake failed");
                if let Err(close_error) = session.close().await {
                    warn!(error = %close_error, "Close after failed handshake also failed");
                }
                Err(e)
            }
        }
    }

    /// Open a TCP link to a WiFi-enabled board and run [`Session::start`].
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the connection is not established within the
    /// configured timeout, or `Io` if it is refused.
    pub async fn connect_tcp(addr: SocketAddr, config: SessionConfig) -> Result<Self> {
        info!("Connecting to board at {}", addr);
        config.validate()?;

        let timeout = config.default_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", addr, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", addr, timeout);
                return Err(Error::Timeout {
                    awaiting: "TCP connect",
                    duration_ms: millis(timeout),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Self::start(stream, config).await
    }

    async fn handshake(&self) -> Result<FirmwareVersion> {
        let reset_wait = self.shared.config.reset_wait;
        if !reset_wait.is_zero() {
            debug!(wait_ms = millis(reset_wait), "Waiting for board reset");
            tokio::time::sleep(reset_wait).await;
        }

        let instance_id = self.are_you_there().await?;
        if let Some(expected) = self.shared.config.instance_id
            && instance_id != expected
        {
            return Err(Error::Handshake(format!(
                "expected instance id {expected}, board reports {instance_id}"
            )));
        }
        debug!(instance_id, "Board identified");

        let version = self.firmware_version().await?;
        self.enable_all_reporting().await?;
        self.reset().await?;
        Ok(version)
    }

    /// Stop reporting, end the read loop and shut the transport down.
    ///
    /// Outstanding queries fail with `TransportLost` and later commands fail
    /// fast. Registered handlers are dropped. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; shutdown problems are logged.
    pub async fn close(&self) -> Result<()> {
        let Some(mut writer) = self.shared.writer.lock().await.take() else {
            debug!("Session already closed");
            return Ok(());
        };
        info!("Closing session");

        let link_was_up = !self.shared.ctx.link.is_lost();
        self.shared.stop("session closed");
        self.shared.ctx.dispatcher.clear_handlers();

        if link_was_up {
            match tokio::time::timeout(CLOSE_GRACE, writer.send(Command::stop_all_reports())).await
            {
                Ok(Ok(())) => trace!("Reporting stopped"),
                Ok(Err(e)) => warn!(error = %e, "Failed to stop reporting during close"),
                Err(_) => warn!("Stop reporting timed out during close"),
            }
        }

        let mut transport = writer.into_inner();
        match tokio::time::timeout(CLOSE_GRACE, transport.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Error while shutting down transport"),
            Err(_) => warn!("Transport shutdown timed out"),
        }

        debug!("Session closed");
        Ok(())
    }

    /// Returns true until the link is lost or the session is closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.ctx.link.is_lost()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn loop_state(&self) -> LoopState {
        *self.shared.ctx.state.borrow()
    }

    /// Watch read loop state transitions.
    #[must_use]
    pub fn subscribe_loop_state(&self) -> watch::Receiver<LoopState> {
        self.shared.ctx.state.subscribe()
    }

    /// Returns true while a query of `kind` is waiting for its reply.
    #[must_use]
    pub fn is_awaiting(&self, kind: ReplyKind) -> bool {
        self.shared.ctx.pending.is_outstanding(kind)
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    async fn send(&self, command: Command) -> Result<()> {
        self.shared.ctx.link.check()?;

        let mut writer = self.shared.writer.lock().await;
        let Some(framed) = writer.as_mut() else {
            return Err(Error::TransportLost("session closed".into()));
        };

        trace!(%command, "Sending command");
        let timeout = self.shared.config.default_timeout;
        match tokio::time::timeout(timeout, framed.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Transport write failed");
                drop(writer);
                let reason = format!("write failed: {e}");
                self.shared.stop(&reason);
                Err(Error::TransportLost(reason))
            }
            Err(_) => {
                warn!("Command write timed out after {:?}", timeout);
                Err(Error::Timeout {
                    awaiting: "command write",
                    duration_ms: millis(timeout),
                })
            }
        }
    }

    async fn query(&self, kind: ReplyKind, command: Command, timeout: Duration) -> Result<Value> {
        self.shared.ctx.link.check()?;
        let reply = self.shared.ctx.pending.reserve(kind)?;
        debug!(awaiting = reply.kind().describe(), "Querying board");
        self.send(command).await?;
        reply.wait(timeout).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Ask the board for its firmware version.
    ///
    /// # Errors
    ///
    /// - `Busy` if another firmware query is outstanding
    /// - `Timeout` if no reply arrives within the configured timeout
    /// - `TransportLost` if the link fails first
    pub async fn firmware_version(&self) -> Result<FirmwareVersion> {
        self.firmware_version_within(self.shared.config.default_timeout)
            .await
    }

    /// [`Session::firmware_version`] with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`Session::firmware_version`].
    pub async fn firmware_version_within(&self, timeout: Duration) -> Result<FirmwareVersion> {
        let value = self
            .query(ReplyKind::FirmwareVersion, Command::get_firmware_version(), timeout)
            .await?;
        match value {
            Value::Firmware(version) => Ok(version),
            other => Err(Error::Handshake(format!(
                "unexpected firmware reply {other:?}"
            ))),
        }
    }

    /// Ask the board for its instance id.
    ///
    /// # Errors
    ///
    /// Same as [`Session::firmware_version`].
    pub async fn are_you_there(&self) -> Result<u8> {
        self.are_you_there_within(self.shared.config.default_timeout)
            .await
    }

    /// [`Session::are_you_there`] with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`Session::firmware_version`].
    pub async fn are_you_there_within(&self, timeout: Duration) -> Result<u8> {
        let value = self
            .query(ReplyKind::IAmHere, Command::are_you_there(), timeout)
            .await?;
        match value {
            Value::InstanceId(id) => Ok(id),
            other => Err(Error::Handshake(format!(
                "unexpected I-am-here reply {other:?}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn check_digital_pin(&self, pin: u8) -> Result<()> {
        let capacity = self.shared.config.pin_capacity;
        if pin >= capacity {
            return Err(Error::InvalidArgument(format!(
                "digital pin {pin} out of range (board has {capacity} pins)"
            )));
        }
        Ok(())
    }

    fn check_analog_pin(&self, pin: u8) -> Result<()> {
        let capacity = self.shared.config.analog_pin_capacity;
        if pin >= capacity {
            return Err(Error::InvalidArgument(format!(
                "analog pin {pin} out of range (board has {capacity} analog inputs)"
            )));
        }
        Ok(())
    }

    fn check_i2c_begun(&self, port: u8) -> Result<()> {
        check_i2c_port(port)?;
        if !self.shared.features().i2c_ports.contains(&port) {
            return Err(Error::InvalidArgument(format!(
                "I2C port {port} has not been started"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pin control
    // ------------------------------------------------------------------

    /// Configure a pin as digital input, pull-up input, output or analog
    /// input. Input modes start reporting immediately.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin, or for a feature
    /// mode that has its own attach operation.
    pub async fn configure_pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        match mode {
            PinMode::AnalogInput => return self.configure_analog_input(pin, 0).await,
            PinMode::DigitalInput | PinMode::DigitalOutput | PinMode::DigitalInputPullup => {
                self.check_digital_pin(pin)?;
            }
            PinMode::Servo | PinMode::Sonar | PinMode::Dht | PinMode::I2c => {
                return Err(Error::InvalidArgument(format!(
                    "{mode} is configured through its own attach operation"
                )));
            }
        }

        self.send(Command::set_pin_mode(pin, mode, 0)?).await?;
        self.shared.state.configure(PinKey::digital(pin), mode);
        debug!(pin, %mode, "Pin configured");
        Ok(())
    }

    /// Configure an analog input. `differential` is the smallest change
    /// between readings that produces a report.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range analog pin.
    pub async fn configure_analog_input(&self, pin: u8, differential: u16) -> Result<()> {
        self.check_analog_pin(pin)?;
        self.send(Command::set_pin_mode(pin, PinMode::AnalogInput, differential)?)
            .await?;
        self.shared
            .state
            .configure(PinKey::analog(pin), PinMode::AnalogInput);
        debug!(pin, differential, "Analog input configured");
        Ok(())
    }

    /// Drive a digital output. `value` must be 0 or 1.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin or value.
    pub async fn digital_write(&self, pin: u8, value: u8) -> Result<()> {
        self.check_digital_pin(pin)?;
        if value > 1 {
            return Err(Error::InvalidArgument(format!(
                "digital value must be 0 or 1, got {value}"
            )));
        }
        self.send(Command::digital_write(pin, value == 1)).await
    }

    /// Write a PWM value to a pin.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin.
    pub async fn analog_write(&self, pin: u8, value: u16) -> Result<()> {
        self.check_digital_pin(pin)?;
        self.send(Command::analog_write(pin, value)).await
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range analog pin.
    pub async fn enable_analog_reporting(&self, pin: u8) -> Result<()> {
        self.check_analog_pin(pin)?;
        self.send(Command::modify_reporting(ReportingAction::AnalogEnable, pin))
            .await
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range analog pin.
    pub async fn disable_analog_reporting(&self, pin: u8) -> Result<()> {
        self.check_analog_pin(pin)?;
        self.send(Command::modify_reporting(ReportingAction::AnalogDisable, pin))
            .await
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin.
    pub async fn enable_digital_reporting(&self, pin: u8) -> Result<()> {
        self.check_digital_pin(pin)?;
        self.send(Command::modify_reporting(ReportingAction::DigitalEnable, pin))
            .await
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin.
    pub async fn disable_digital_reporting(&self, pin: u8) -> Result<()> {
        self.check_digital_pin(pin)?;
        self.send(Command::modify_reporting(ReportingAction::DigitalDisable, pin))
            .await
    }

    /// Turn off reporting for every pin. Features keep reporting.
    ///
    /// # Errors
    ///
    /// Returns `TransportLost` if the link is down.
    pub async fn disable_all_reporting(&self) -> Result<()> {
        self.send(Command::modify_reporting(ReportingAction::DisableAll, 0))
            .await
    }

    /// Pause every periodic report on the board.
    ///
    /// # Errors
    ///
    /// Returns `TransportLost` if the link is down.
    pub async fn stop_all_reporting(&self) -> Result<()> {
        self.send(Command::stop_all_reports()).await
    }

    /// Resume every periodic report paused by
    /// [`Session::stop_all_reporting`].
    ///
    /// # Errors
    ///
    /// Returns `TransportLost` if the link is down.
    pub async fn enable_all_reporting(&self) -> Result<()> {
        self.send(Command::enable_all_reports()).await
    }

    /// Set how often the board scans analog inputs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero interval.
    pub async fn set_analog_scan_interval(&self, interval_ms: u8) -> Result<()> {
        if interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "analog scan interval must be at least 1ms".into(),
            ));
        }
        self.send(Command::set_analog_scan_interval(interval_ms))
            .await
    }

    // ------------------------------------------------------------------
    // Servo
    // ------------------------------------------------------------------

    /// Attach a servo with the given pulse range in microseconds.
    ///
    /// A board without a free servo slot answers with a servo-unavailable
    /// report, delivered as a diagnostic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin or an empty pulse
    /// range.
    pub async fn attach_servo(&self, pin: u8, min_pulse: u16, max_pulse: u16) -> Result<()> {
        self.check_digital_pin(pin)?;
        if min_pulse >= max_pulse {
            return Err(Error::InvalidArgument(format!(
                "servo pulse range {min_pulse}..{max_pulse} is empty"
            )));
        }

        self.send(Command::servo_attach(pin, min_pulse, max_pulse))
            .await?;
        self.shared.features().servos.insert(pin);
        self.shared
            .state
            .configure(PinKey::new(Space::Servo, pin), PinMode::Servo);
        debug!(pin, min_pulse, max_pulse, "Servo attached");
        Ok(())
    }

    /// Move an attached servo.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the angle exceeds 180 degrees or no
    /// servo is attached to `pin`.
    pub async fn servo_write(&self, pin: u8, angle: u8) -> Result<()> {
        self.check_digital_pin(pin)?;
        if angle > MAX_SERVO_ANGLE {
            return Err(Error::InvalidArgument(format!(
                "servo angle {angle} exceeds {MAX_SERVO_ANGLE}"
            )));
        }
        if !self.shared.features().servos.contains(&pin) {
            return Err(Error::InvalidArgument(format!(
                "no servo attached to pin {pin}"
            )));
        }
        self.send(Command::servo_write(pin, angle)).await
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if no servo is attached to `pin`.
    pub async fn detach_servo(&self, pin: u8) -> Result<()> {
        self.check_digital_pin(pin)?;
        if !self.shared.features().servos.contains(&pin) {
            return Err(Error::InvalidArgument(format!(
                "no servo attached to pin {pin}"
            )));
        }
        self.send(Command::servo_detach(pin)).await?;
        self.shared.features().servos.remove(&pin);
        debug!(pin, "Servo detached");
        Ok(())
    }

    // ------------------------------------------------------------------
    // I2C
    // ------------------------------------------------------------------

    /// Initialize an I2C port. Starting a port twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a port other than 0 or 1.
    pub async fn i2c_begin(&self, port: u8) -> Result<()> {
        check_i2c_port(port)?;
        if !self.shared.features().i2c_ports.insert(port) {
            trace!(port, "I2C port already started");
            return Ok(());
        }

        if let Err(e) = self.send(Command::i2c_begin(port)).await {
            self.shared.features().i2c_ports.remove(&port);
            return Err(e);
        }
        self.shared
            .state
            .configure(PinKey::new(Space::I2c, port), PinMode::I2c);
        debug!(port, "I2C port started");
        Ok(())
    }

    /// Request `count` bytes from `register` of the device at `address`.
    /// The data arrives as an I2C read event on `(I2c, port)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the port was not started or `count` is
    /// outside 1..=32.
    pub async fn i2c_read(&self, port: u8, address: u8, register: u8, count: u8) -> Result<()> {
        self.i2c_read_inner(port, address, register, count, true)
            .await
    }

    /// Like [`Session::i2c_read`], but sends a restart instead of a stop
    /// after writing the register, for devices that require it.
    ///
    /// # Errors
    ///
    /// See [`Session::i2c_read`].
    pub async fn i2c_read_restart_transmission(
        &self,
        port: u8,
        address: u8,
        register: u8,
        count: u8,
    ) -> Result<()> {
        self.i2c_read_inner(port, address, register, count, false)
            .await
    }

    async fn i2c_read_inner(
        &self,
        port: u8,
        address: u8,
        register: u8,
        count: u8,
        stop_transmission: bool,
    ) -> Result<()> {
        self.check_i2c_begun(port)?;
        if count == 0 || usize::from(count) > MAX_I2C_DATA {
            return Err(Error::InvalidArgument(format!(
                "I2C read must request 1-{MAX_I2C_DATA} bytes, got {count}"
            )));
        }
        self.send(Command::i2c_read(
            address,
            register,
            count,
            stop_transmission,
            port,
        ))
        .await
    }

    /// Write `data` to the device at `address`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the port was not started or `data` is
    /// empty or longer than 32 bytes.
    pub async fn i2c_write(&self, port: u8, address: u8, data: &[u8]) -> Result<()> {
        self.check_i2c_begun(port)?;
        let command = Command::i2c_write(address, port, data)?;
        self.send(command).await
    }

    // ------------------------------------------------------------------
    // Feature attachments
    // ------------------------------------------------------------------

    /// Attach a sonar and route its distance reports to `handler`. Events
    /// are keyed by the trigger pin.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for out-of-range or identical pins, a
    /// trigger pin that already has a sonar, or when six sonars are
    /// attached.
    pub async fn attach_sonar<F>(&self, trigger_pin: u8, echo_pin: u8, handler: F) -> Result<()>
    where
        F: Fn(PinEvent) + Send + Sync + 'static,
    {
        self.check_digital_pin(trigger_pin)?;
        self.check_digital_pin(echo_pin)?;
        if trigger_pin == echo_pin {
            return Err(Error::InvalidArgument(format!(
                "sonar trigger and echo cannot share pin {trigger_pin}"
            )));
        }
        {
            let mut features = self.shared.features();
            if features.sonars.contains(&trigger_pin) {
                return Err(Error::InvalidArgument(format!(
                    "sonar already attached to pin {trigger_pin}"
                )));
            }
            if features.sonars.len() >= MAX_SONARS {
                return Err(Error::InvalidArgument(format!(
                    "at most {MAX_SONARS} sonars can be attached"
                )));
            }
            features.sonars.insert(trigger_pin);
        }

        let key = PinKey::new(Space::Sonar, trigger_pin);
        self.shared.ctx.dispatcher.register(key, Arc::new(handler));
        if let Err(e) = self.send(Command::sonar_new(trigger_pin, echo_pin)).await {
            self.shared.features().sonars.remove(&trigger_pin);
            self.shared.ctx.dispatcher.unregister(key);
            return Err(e);
        }
        self.shared.state.configure(key, PinMode::Sonar);
        debug!(trigger_pin, echo_pin, "Sonar attached");
        Ok(())
    }

    /// Attach a DHT sensor and route its readings to `handler`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an out-of-range pin, a pin that already
    /// has a DHT, or when six DHTs are attached.
    pub async fn attach_dht<F>(&self, pin: u8, handler: F) -> Result<()>
    where
        F: Fn(PinEvent) + Send + Sync + 'static,
    {
        self.check_digital_pin(pin)?;
        {
            let mut features = self.shared.features();
            if features.dhts.contains(&pin) {
                return Err(Error::InvalidArgument(format!(
                    "DHT already attached to pin {pin}"
                )));
            }
            if features.dhts.len() >= MAX_DHTS {
                return Err(Error::InvalidArgument(format!(
                    "at most {MAX_DHTS} DHT sensors can be attached"
                )));
            }
            features.dhts.insert(pin);
        }

        let key = PinKey::new(Space::Dht, pin);
        self.shared.ctx.dispatcher.register(key, Arc::new(handler));
        if let Err(e) = self.send(Command::dht_new(pin)).await {
            self.shared.features().dhts.remove(&pin);
            self.shared.ctx.dispatcher.unregister(key);
            return Err(e);
        }
        self.shared.state.configure(key, PinMode::Dht);
        debug!(pin, "DHT attached");
        Ok(())
    }

    /// Send `byte` to the board and have the echo delivered to `handler`.
    ///
    /// # Errors
    ///
    /// Returns `TransportLost` if the link is down.
    pub async fn loop_back<F>(&self, byte: u8, handler: F) -> Result<()>
    where
        F: Fn(PinEvent) + Send + Sync + 'static,
    {
        self.shared
            .ctx
            .dispatcher
            .register(PinKey::new(Space::LoopBack, 0), Arc::new(handler));
        self.send(Command::loop_back(byte)).await
    }

    /// Reset the board's pin and feature tables and forget everything known
    /// about them locally. Registered handlers are kept.
    ///
    /// # Errors
    ///
    /// Returns `TransportLost` if the link is down.
    pub async fn reset(&self) -> Result<()> {
        self.send(Command::reset()).await?;
        self.shared.state.clear();
        *self.shared.features() = Features::default();
        info!("Board reset");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handlers and state
    // ------------------------------------------------------------------

    /// Deliver every event for `(space, id)` to `handler`, replacing any
    /// previous handler for that key.
    pub fn register_callback<F>(&self, space: Space, id: u8, handler: F)
    where
        F: Fn(PinEvent) + Send + Sync + 'static,
    {
        let key = PinKey::new(space, id);
        if self
            .shared
            .ctx
            .dispatcher
            .register(key, Arc::new(handler))
            .is_some()
        {
            debug!(%space, id, "Replaced callback");
        }
    }

    /// Returns true if a handler was registered for `(space, id)`.
    pub fn unregister_callback(&self, space: Space, id: u8) -> bool {
        self.shared
            .ctx
            .dispatcher
            .unregister(PinKey::new(space, id))
    }

    /// Receive frame errors, device faults and debug prints.
    pub fn on_diagnostic<F>(&self, handler: F)
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        self.shared.ctx.dispatcher.on_diagnostic(Arc::new(handler));
    }

    /// Last reported value for `(space, id)`; `Ok(None)` if configured but
    /// nothing has been reported yet.
    ///
    /// # Errors
    ///
    /// Returns `NotConfigured` if nothing is known about the key.
    pub fn last_value(&self, space: Space, id: u8) -> Result<Option<Value>> {
        self.shared.state.get(PinKey::new(space, id))
    }

    #[must_use]
    pub fn state_entry(&self, space: Space, id: u8) -> Option<StateEntry> {
        self.shared.state.entry(PinKey::new(space, id))
    }
}

fn check_i2c_port(port: u8) -> Result<()> {
    if port >= I2C_PORT_COUNT {
        return Err(Error::InvalidArgument(format!(
            "I2C port must be 0 or 1, got {port}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rstest::rstest;
    use telemetrix_core::constants;
    use telemetrix_protocol::{BoardCodec, CommandCode, Report, ReportFrame};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::codec::Framed;

    async fn session() -> (Session, DuplexStream) {
        let (host, board) = tokio::io::duplex(1024);
        let session = Session::connect(host, SessionConfig::default())
            .await
            .unwrap();
        (session, board)
    }

    async fn next_command(board: &mut Framed<DuplexStream, BoardCodec>) -> Command {
        tokio::time::timeout(Duration::from_secs(1), board.next())
            .await
            .expect("no command")
            .expect("board closed")
            .unwrap()
            .unwrap()
    }

    #[rstest]
    #[case::digital_pin_out_of_range(20, PinMode::DigitalOutput)]
    #[case::analog_pin_out_of_range(6, PinMode::AnalogInput)]
    #[case::servo_mode(3, PinMode::Servo)]
    #[case::i2c_mode(3, PinMode::I2c)]
    #[tokio::test]
    async fn test_configure_pin_mode_rejects(#[case] pin: u8, #[case] mode: PinMode) {
        let (session, _board) = session().await;
        let result = session.configure_pin_mode(pin, mode).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_configure_records_mode() {
        let (session, board) = session().await;
        let mut board = Framed::new(board, BoardCodec::new());

        session
            .configure_pin_mode(2, PinMode::AnalogInput)
            .await
            .unwrap();
        let command = next_command(&mut board).await;
        assert_eq!(command.code(), CommandCode::SetPinMode);
        assert_eq!(command.args(), &[2, 3, 0, 0, 1]);

        let entry = session.state_entry(Space::Analog, 2).unwrap();
        assert_eq!(entry.mode, Some(PinMode::AnalogInput));
        assert_eq!(session.last_value(Space::Analog, 2).unwrap(), None);
    }

    #[rstest]
    #[case::value_two(5, 2)]
    #[case::pin_at_capacity(20, 1)]
    #[tokio::test]
    async fn test_digital_write_validation(#[case] pin: u8, #[case] value: u8) {
        let (session, _board) = session().await;
        let result = session.digital_write(pin, value).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_servo_requires_attach() {
        let (session, board) = session().await;
        let mut board = Framed::new(board, BoardCodec::new());

        assert!(matches!(
            session.servo_write(9, 90).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.attach_servo(9, 2400, 544).await,
            Err(Error::InvalidArgument(_))
        ));

        session
            .attach_servo(
                9,
                constants::DEFAULT_SERVO_MIN_PULSE,
                constants::DEFAULT_SERVO_MAX_PULSE,
            )
            .await
            .unwrap();
        assert!(matches!(
            session.servo_write(9, 181).await,
            Err(Error::InvalidArgument(_))
        ));
        session.servo_write(9, 90).await.unwrap();

        assert_eq!(next_command(&mut board).await.code(), CommandCode::ServoAttach);
        let write = next_command(&mut board).await;
        assert_eq!(write.code(), CommandCode::ServoWrite);
        assert_eq!(write.args(), &[9, 90]);

        session.detach_servo(9).await.unwrap();
        assert!(matches!(
            session.servo_write(9, 90).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_i2c_requires_begin() {
        let (session, board) = session().await;
        let mut board = Framed::new(board, BoardCodec::new());

        assert!(matches!(
            session.i2c_read(0, 0x68, 0x3B, 6).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.i2c_begin(2).await,
            Err(Error::InvalidArgument(_))
        ));

        session.i2c_begin(0).await.unwrap();
        session.i2c_begin(0).await.unwrap();
        session.i2c_read(0, 0x68, 0x3B, 6).await.unwrap();
        assert!(matches!(
            session.i2c_read(0, 0x68, 0x3B, 33).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.i2c_write(0, 0x68, &[]).await,
            Err(Error::InvalidArgument(_))
        ));

        // The second begin sent nothing
        assert_eq!(next_command(&mut board).await.code(), CommandCode::I2cBegin);
        let read = next_command(&mut board).await;
        assert_eq!(read.code(), CommandCode::I2cRead);
        assert_eq!(read.args(), &[0x68, 0x3B, 6, 1, 0]);
    }

    #[tokio::test]
    async fn test_sonar_limits() {
        let (session, _board) = session().await;

        for trigger in 0..6 {
            session
                .attach_sonar(trigger, trigger + 10, |_| {})
                .await
                .unwrap();
        }
        assert!(matches!(
            session.attach_sonar(0, 16, |_| {}).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.attach_sonar(7, 17, |_| {}).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.attach_sonar(8, 8, |_| {}).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_forgets_features() {
        let (session, _board) = session().await;
        session.attach_dht(4, |_| {}).await.unwrap();
        assert!(session.state_entry(Space::Dht, 4).is_some());

        session.reset().await.unwrap();
        assert!(session.state_entry(Space::Dht, 4).is_none());
        // The slot is free again
        session.attach_dht(4, |_| {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_back_echo_reaches_handler() {
        let (session, board) = session().await;
        let mut board = Framed::new(board, BoardCodec::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        session
            .loop_back(0x5A, move |event| {
                let _ = tx.send(event.value);
            })
            .await
            .unwrap();

        let command = next_command(&mut board).await;
        assert_eq!(command.args(), &[0x5A]);
        let frame: ReportFrame = Report::LoopBack(0x5A).to_frame().unwrap();
        board.send(frame).await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Value::LoopBack(0x5A));
    }

    #[tokio::test]
    async fn test_close_sends_stop_and_shuts_down() {
        let (session, mut board) = session().await;
        session.close().await.unwrap();

        let mut received = Vec::new();
        board.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![1, constants::STOP_ALL_REPORTS]);

        assert!(!session.is_connected());
        assert_eq!(session.loop_state(), LoopState::Stopped);
        assert!(matches!(
            session.enable_all_reporting().await,
            Err(Error::TransportLost(_))
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_handlers_holding_the_session() {
        let (session, _board) = session().await;
        session.register_callback(Space::Digital, 2, {
            let session = session.clone();
            move |_| {
                let _ = session.is_connected();
            }
        });
        session.on_diagnostic({
            let session = session.clone();
            move |_| {
                let _ = session.is_connected();
            }
        });
        assert_eq!(Arc::strong_count(&session.shared), 3);

        session.close().await.unwrap();
        assert_eq!(Arc::strong_count(&session.shared), 1);
    }
}
