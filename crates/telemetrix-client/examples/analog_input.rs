//! Print analog input A2 until Ctrl-C.
//!
//! ```text
//! cargo run --example analog_input -- 192.168.2.50:31335
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use telemetrix_client::{Diagnostic, Session, SessionConfig};
use telemetrix_core::constants::DEFAULT_TCP_PORT;
use telemetrix_core::{Space, Value};
use tracing_subscriber::EnvFilter;

const POTENTIOMETER: u8 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{DEFAULT_TCP_PORT}"))
        .parse()
        .context("expected a board address such as 192.168.2.50:31335")?;

    let session = Session::connect_tcp(addr, SessionConfig::default()).await?;

    session.on_diagnostic(|diagnostic| match diagnostic {
        Diagnostic::Frame(error) => eprintln!("dropped input: {error}"),
        Diagnostic::DeviceFault(fault) => eprintln!("board fault: {fault}"),
        Diagnostic::Debug { id, value } => eprintln!("debug {id}: {value}"),
    });
    session.register_callback(Space::Analog, POTENTIOMETER, |event| {
        if let Value::Analog(value) = event.value {
            println!(
                "{} A{} = {value:4}",
                event.timestamp.received_at.format("%H:%M:%S%.3f"),
                event.id
            );
        }
    });

    // Only report changes of at least 5 counts
    session.configure_analog_input(POTENTIOMETER, 5).await?;

    tokio::signal::ctrl_c().await?;
    session.disable_analog_reporting(POTENTIOMETER).await?;
    session.close().await?;
    Ok(())
}
