//! Report Dispatcher.
//!
//! Maps each decoded report to a `(space, id, value)` triple, stores the
//! value in the [`DeviceStateTable`], completes any pending reply waiting for
//! it, and finally invokes the handler registered for that key.
//!
//! ```text
//!  Report ──► route ──┬──► state.set(key, value)      (always)
//!                     ├──► pending.fulfill(kind)      (firmware, I-am-here)
//!                     └──► handler(PinEvent)          (if registered)
//!
//!  Faults, debug prints, frame errors ──► diagnostic handler
//! ```
//!
//! Handlers are cloned out of the registry before they run, so no lock is
//! held while user code executes. A handler may register or unregister
//! handlers, or hand work to a spawned task that sends commands.
//!
//! A handler that panics is logged and skipped; the report still counts as
//! delivered and the next one is dispatched normally. This relies on
//! unwinding, so a build with `panic = "abort"` terminates instead.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use telemetrix_core::{FrameError, PinKey, Space, Timestamp, Value};
use telemetrix_protocol::{DhtReading, Report};
use tracing::{debug, error, trace, warn};

use crate::pending::{PendingReplies, ReplyKind};
use crate::state::DeviceStateTable;

/// A report routed to a pin or feature.
#[derive(Debug, Clone, PartialEq)]
pub struct PinEvent {
    pub space: Space,
    pub id: u8,
    pub value: Value,
    pub timestamp: Timestamp,
}

impl PinEvent {
    #[must_use]
    pub fn key(&self) -> PinKey {
        PinKey::new(self.space, self.id)
    }
}

/// User callback for pin and feature reports.
pub type Handler = Arc<dyn Fn(PinEvent) + Send + Sync>;

/// User callback for diagnostics.
pub type DiagnosticHandler = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Error condition reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// No free servo slot for an attach request.
    ServoUnavailable { pin: u8 },
    /// An I2C read returned fewer bytes than requested.
    I2cTooFewBytes { port: u8, address: u8 },
    /// An I2C read returned more bytes than requested.
    I2cTooManyBytes { port: u8, address: u8 },
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServoUnavailable { pin } => write!(f, "no servo available for pin {pin}"),
            Self::I2cTooFewBytes { port, address } => {
                write!(f, "too few bytes from I2C device {address:#04x} on port {port}")
            }
            Self::I2cTooManyBytes { port, address } => {
                write!(f, "too many bytes from I2C device {address:#04x} on port {port}")
            }
        }
    }
}

/// Out-of-band notifications that are not pin values.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Input bytes were discarded while resynchronizing.
    Frame(FrameError),
    /// The firmware reported a fault.
    DeviceFault(DeviceFault),
    /// Debug value printed by the firmware.
    Debug { id: u8, value: u16 },
}

enum Route {
    Pin {
        key: PinKey,
        value: Value,
        reply: Option<ReplyKind>,
    },
    Diagnostic(Diagnostic),
}

fn route(report: &Report) -> Route {
    let to_pin = |space, id, value| Route::Pin {
        key: PinKey::new(space, id),
        value,
        reply: None,
    };

    match report {
        Report::Digital { pin: id, value } => to_pin(Space::Digital, *id, Value::Digital(*value)),
        Report::Analog { pin: id, value } => to_pin(Space::Analog, *id, Value::Analog(*value)),
        Report::SonarDistance {
            trigger_pin,
            distance_cm,
        } => to_pin(Space::Sonar, *trigger_pin, Value::Distance(*distance_cm)),
        Report::Dht { pin: id, reading } => {
            let value = match *reading {
                DhtReading::Data {
                    humidity,
                    temperature,
                } => Value::Dht {
                    humidity,
                    temperature,
                },
                DhtReading::Error(code) => Value::DhtError(code),
            };
            to_pin(Space::Dht, *id, value)
        }
        Report::I2cRead {
            port,
            address,
            register,
            data,
        } => to_pin(
            Space::I2c,
            *port,
            Value::I2c {
                address: *address,
                register: *register,
                data: data.clone(),
            },
        ),
        Report::LoopBack(byte) => to_pin(Space::LoopBack, 0, Value::LoopBack(*byte)),
        Report::FirmwareVersion(version) => Route::Pin {
            key: PinKey::new(Space::Firmware, 0),
            value: Value::Firmware(*version),
            reply: Some(ReplyKind::FirmwareVersion),
        },
        Report::IAmHere { instance_id } => Route::Pin {
            key: PinKey::new(Space::Board, 0),
            value: Value::InstanceId(*instance_id),
            reply: Some(ReplyKind::IAmHere),
        },
        Report::ServoUnavailable { pin } => {
            Route::Diagnostic(Diagnostic::DeviceFault(DeviceFault::ServoUnavailable { pin: *pin }))
        }
        Report::I2cTooFewBytes { port, address } => Route::Diagnostic(Diagnostic::DeviceFault(
            DeviceFault::I2cTooFewBytes {
                port: *port,
                address: *address,
            },
        )),
        Report::I2cTooManyBytes { port, address } => Route::Diagnostic(Diagnostic::DeviceFault(
            DeviceFault::I2cTooManyBytes {
                port: *port,
                address: *address,
            },
        )),
        Report::DebugPrint { id, value } => Route::Diagnostic(Diagnostic::Debug {
            id: *id,
            value: *value,
        }),
    }
}

pub struct ReportDispatcher {
    handlers: RwLock<HashMap<PinKey, Handler>>,
    diagnostic: RwLock<Option<DiagnosticHandler>>,
    state: Arc<DeviceStateTable>,
    pending: Arc<PendingReplies>,
    sequence: AtomicU64,
}

impl fmt::Debug for ReportDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ReportDispatcher")
            .field("handlers", &handlers.keys().collect::<Vec<_>>())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReportDispatcher {
    #[must_use]
    pub fn new(state: Arc<DeviceStateTable>, pending: Arc<PendingReplies>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            diagnostic: RwLock::new(None),
            state,
            pending,
            sequence: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `key`, replacing any previous one.
    ///
    /// Returns the handler that was replaced.
    pub fn register(&self, key: PinKey, handler: Handler) -> Option<Handler> {
        debug!(%key, "Registering handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler)
    }

    /// Remove the handler for `key`. Returns `true` if one was registered.
    pub fn unregister(&self, key: PinKey) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    #[must_use]
    pub fn is_registered(&self, key: PinKey) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    /// Install the diagnostic handler, replacing any previous one.
    pub fn on_diagnostic(&self, handler: DiagnosticHandler) {
        *self.diagnostic.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Route one report.
    ///
    /// Returns the event for pin and feature reports, `None` for reports
    /// that only produce diagnostics.
    pub fn dispatch(&self, report: &Report) -> Option<PinEvent> {
        match route(report) {
            Route::Pin { key, value, reply } => {
                let timestamp = self.next_timestamp();
                self.state.set(key, value.clone(), timestamp);
                if let Some(kind) = reply
                    && self.pending.fulfill(kind, value.clone())
                {
                    trace!(?kind, "Completed pending reply");
                }

                let event = PinEvent {
                    space: key.space,
                    id: key.id,
                    value,
                    timestamp,
                };
                let handler = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&key)
                    .cloned();
                if let Some(handler) = handler {
                    trace!(%key, sequence = timestamp.sequence, "Invoking handler");
                    let delivered = event.clone();
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(delivered))) {
                        error!(%key, panic = panic_message(&*panic), "Handler panicked");
                    }
                }
                Some(event)
            }
            Route::Diagnostic(diagnostic) => {
                if let Diagnostic::DeviceFault(fault) = &diagnostic {
                    warn!(%fault, "Device fault reported");
                }
                self.diagnose(&diagnostic);
                None
            }
        }
    }

    /// Drop every pin handler and the diagnostic handler.
    pub fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.diagnostic.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Forward a diagnostic to the installed handler, if any.
    pub fn diagnose(&self, diagnostic: &Diagnostic) {
        let handler = self
            .diagnostic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler
            && let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(diagnostic)))
        {
            error!(panic = panic_message(&*panic), "Diagnostic handler panicked");
        }
    }

    fn next_timestamp(&self) -> Timestamp {
        Timestamp::now(self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use telemetrix_core::{FirmwareVersion, FrameErrorKind};

    fn dispatcher() -> (ReportDispatcher, Arc<DeviceStateTable>, Arc<PendingReplies>) {
        let state = Arc::new(DeviceStateTable::new());
        let pending = Arc::new(PendingReplies::new());
        (
            ReportDispatcher::new(state.clone(), pending.clone()),
            state,
            pending,
        )
    }

    fn recorder() -> (Handler, Arc<Mutex<Vec<PinEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler = Arc::new(move |event| sink.lock().unwrap().push(event));
        (handler, seen)
    }

    #[test]
    fn test_dispatch_without_handler_updates_state() {
        let (dispatcher, state, _) = dispatcher();

        let event = dispatcher
            .dispatch(&Report::Analog { pin: 3, value: 512 })
            .unwrap();

        assert_eq!(event.key(), PinKey::analog(3));
        assert_eq!(state.get(PinKey::analog(3)).unwrap(), Some(Value::Analog(512)));
    }

    #[test]
    fn test_state_updated_before_handler_runs() {
        let (dispatcher, state, _) = dispatcher();
        let observed = Arc::new(Mutex::new(None));

        let sink = observed.clone();
        let table = state.clone();
        dispatcher.register(
            PinKey::digital(7),
            Arc::new(move |_| {
                *sink.lock().unwrap() = table.get(PinKey::digital(7)).unwrap();
            }),
        );

        dispatcher.dispatch(&Report::Digital { pin: 7, value: 1 });
        assert_eq!(*observed.lock().unwrap(), Some(Value::Digital(1)));
    }

    #[test]
    fn test_register_twice_invokes_once() {
        let (dispatcher, _, _) = dispatcher();
        let (handler, seen) = recorder();

        assert!(dispatcher.register(PinKey::digital(2), handler.clone()).is_none());
        assert!(dispatcher.register(PinKey::digital(2), handler).is_some());

        dispatcher.dispatch(&Report::Digital { pin: 2, value: 0 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_keys_are_per_space() {
        let (dispatcher, _, _) = dispatcher();
        let (handler, seen) = recorder();
        dispatcher.register(PinKey::analog(3), handler);

        dispatcher.dispatch(&Report::Digital { pin: 3, value: 1 });
        assert!(seen.lock().unwrap().is_empty());

        dispatcher.dispatch(&Report::Analog { pin: 3, value: 1 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unregister() {
        let (dispatcher, _, _) = dispatcher();
        let (handler, seen) = recorder();
        dispatcher.register(PinKey::digital(2), handler);

        assert!(dispatcher.unregister(PinKey::digital(2)));
        assert!(!dispatcher.unregister(PinKey::digital(2)));

        dispatcher.dispatch(&Report::Digital { pin: 2, value: 1 });
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (dispatcher, state, _) = dispatcher();
        let (handler, seen) = recorder();
        dispatcher.register(PinKey::digital(2), Arc::new(|_| panic!("handler bug")));
        dispatcher.register(PinKey::digital(3), handler);
        dispatcher.on_diagnostic(Arc::new(|_: &Diagnostic| panic!("diagnostic bug")));

        let event = dispatcher.dispatch(&Report::Digital { pin: 2, value: 1 });
        assert!(event.is_some());
        assert_eq!(state.get(PinKey::digital(2)).unwrap(), Some(Value::Digital(1)));
        assert!(dispatcher.dispatch(&Report::DebugPrint { id: 1, value: 5 }).is_none());

        // The panicking handler stays registered and later reports still flow
        dispatcher.dispatch(&Report::Digital { pin: 2, value: 0 });
        dispatcher.dispatch(&Report::Digital { pin: 3, value: 1 });
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(state.get(PinKey::digital(2)).unwrap(), Some(Value::Digital(0)));
    }

    #[test]
    fn test_clear_handlers() {
        let (dispatcher, _, _) = dispatcher();
        let (handler, seen) = recorder();
        dispatcher.register(PinKey::digital(2), handler.clone());
        dispatcher.on_diagnostic(Arc::new(|_: &Diagnostic| {}));

        dispatcher.clear_handlers();

        assert!(!dispatcher.is_registered(PinKey::digital(2)));
        dispatcher.dispatch(&Report::Digital { pin: 2, value: 1 });
        assert!(seen.lock().unwrap().is_empty());
        // Only the local clone is left
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_events_carry_increasing_sequence() {
        let (dispatcher, _, _) = dispatcher();
        let (handler, seen) = recorder();
        dispatcher.register(PinKey::analog(0), handler);

        for value in 0..10 {
            dispatcher.dispatch(&Report::Analog { pin: 0, value });
        }

        let seen = seen.lock().unwrap();
        let values: Vec<_> = seen.iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, (0..10).map(Value::Analog).collect::<Vec<_>>());
        assert!(seen.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_firmware_report_fulfills_pending() {
        let (dispatcher, state, pending) = dispatcher();
        let reply = pending.reserve(ReplyKind::FirmwareVersion).unwrap();

        dispatcher.dispatch(&Report::FirmwareVersion(FirmwareVersion::new(2, 9)));

        let value = reply.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(value, Value::Firmware(FirmwareVersion::new(2, 9)));
        assert_eq!(
            state.get(PinKey::new(Space::Firmware, 0)).unwrap(),
            Some(Value::Firmware(FirmwareVersion::new(2, 9)))
        );
    }

    #[test]
    fn test_dht_and_i2c_routing() {
        let (dispatcher, state, _) = dispatcher();

        dispatcher.dispatch(&Report::Dht {
            pin: 8,
            reading: DhtReading::Error(2),
        });
        dispatcher.dispatch(&Report::I2cRead {
            port: 1,
            address: 0x53,
            register: 0x32,
            data: vec![7, 8],
        });

        assert_eq!(
            state.get(PinKey::new(Space::Dht, 8)).unwrap(),
            Some(Value::DhtError(2))
        );
        assert_eq!(
            state.get(PinKey::new(Space::I2c, 1)).unwrap(),
            Some(Value::I2c {
                address: 0x53,
                register: 0x32,
                data: vec![7, 8]
            })
        );
    }

    #[test]
    fn test_faults_go_to_diagnostics() {
        let (dispatcher, state, _) = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.on_diagnostic(Arc::new(move |d: &Diagnostic| {
            sink.lock().unwrap().push(d.clone())
        }));

        assert!(dispatcher.dispatch(&Report::ServoUnavailable { pin: 9 }).is_none());
        assert!(dispatcher.dispatch(&Report::DebugPrint { id: 1, value: 5 }).is_none());
        dispatcher.diagnose(&Diagnostic::Frame(FrameError::new(
            FrameErrorKind::BadLength(0),
            1,
        )));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[0],
            Diagnostic::DeviceFault(DeviceFault::ServoUnavailable { pin: 9 })
        );
        assert_eq!(seen[1], Diagnostic::Debug { id: 1, value: 5 });
        assert!(state.is_empty());
    }

    #[test]
    fn test_handler_may_reregister() {
        let (dispatcher, _, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let (replacement, seen) = recorder();

        let inner = dispatcher.clone();
        dispatcher.register(
            PinKey::digital(4),
            Arc::new(move |_| {
                inner.register(PinKey::digital(4), replacement.clone());
            }),
        );

        dispatcher.dispatch(&Report::Digital { pin: 4, value: 1 });
        dispatcher.dispatch(&Report::Digital { pin: 4, value: 0 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
