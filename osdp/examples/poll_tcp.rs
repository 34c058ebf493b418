//! Poll the peripherals of a device profile through a TCP serial server
//!
//! ```text
//! OSDP_PROFILES=devices.json OSDP_PROFILE=lobby cargo run --example poll_tcp
//! ```

use std::time::Duration;

use osdp::config::load_profile;
use osdp::{Bus, CommandFields};
use osdp_core::CommandCode;
use osdp_transport::TcpTransport;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> osdp::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::var("OSDP_PROFILES").unwrap_or_else(|_| "devices.json".to_string());
    let name = std::env::var("OSDP_PROFILE").unwrap_or_else(|_| "default".to_string());
    let seconds: u64 = std::env::var("OSDP_RUN_SECONDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(10);

    let profile = load_profile(&path, &name)?;
    let (host, port) = profile.endpoint()?;
    let config = profile.bus_config()?;

    match profile.baud {
        Some(baud) => println!("Profile {} ({} baud) via {}:{}", name, baud, host, port),
        None => println!("Profile {} via {}:{}", name, host, port),
    }

    let (mut bus, panel, mut events) = Bus::new(config, TcpTransport::new(host, port));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { bus.run(shutdown).await }
    });

    // Identify every peripheral once, then let the bus poll
    for &address in panel.addresses() {
        panel.send_command(address, CommandCode::Id, CommandFields::Empty)?;
        panel.send_command(address, CommandCode::Cap, CommandFields::Empty)?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", event),
                None => break,
            },
        }
    }

    shutdown.cancel();
    match task.await {
        Ok(result) => result?,
        Err(e) => eprintln!("Bus task failed: {}", e),
    }

    println!("Stopped");

    Ok(())
}
