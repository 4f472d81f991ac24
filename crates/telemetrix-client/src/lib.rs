//! Async host-side client for boards running Telemetrix firmware.
//!
//! [`Session`] is the entry point: it validates and sends commands, runs the
//! read loop that decodes incoming reports, keeps the last known value of
//! every pin in a [`DeviceStateTable`] and routes events to registered
//! handlers.
//!
//! ```no_run
//! use telemetrix_client::{Session, SessionConfig};
//! use telemetrix_core::PinMode;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect_tcp("192.168.2.50:31335".parse()?, SessionConfig::default()).await?;
//! println!("firmware {}", session.firmware_version().await?);
//! session.configure_pin_mode(13, PinMode::DigitalOutput).await?;
//! session.digital_write(13, 1).await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod pending;
pub mod read_loop;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use dispatcher::{DeviceFault, Diagnostic, DiagnosticHandler, Handler, PinEvent, ReportDispatcher};
pub use pending::{PendingReplies, PendingReply, ReplyKind};
pub use read_loop::LoopState;
pub use session::Session;
pub use state::{DeviceStateTable, StateEntry};
