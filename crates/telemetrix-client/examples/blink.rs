//! Blink the on-board LED of a WiFi-attached board.
//!
//! ```text
//! RUST_LOG=telemetrix_client=debug cargo run --example blink -- 192.168.2.50:31335
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use telemetrix_client::{Session, SessionConfig};
use telemetrix_core::PinMode;
use telemetrix_core::constants::DEFAULT_TCP_PORT;
use tracing_subscriber::EnvFilter;

const LED_PIN: u8 = 13;

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

    let session = Session::connect_tcp(addr, SessionConfig::default())
        .await
        .with_context(|| format!("could not start a session with {addr}"))?;
    println!("firmware {}", session.firmware_version().await?);

    session.configure_pin_mode(LED_PIN, PinMode::DigitalOutput).await?;
    for _ in 0..5 {
        session.digital_write(LED_PIN, 1).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        session.digital_write(LED_PIN, 0).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    session.close().await?;
    Ok(())
}
