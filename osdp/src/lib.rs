//! # osdp
//!
//! Controller side of the Open Supervised Device Protocol (OSDP).
//!
//! ## Features
//!
//! - Round-robin bus scheduler with one command in flight
//! - Per-peripheral retry, backoff and fault recovery
//! - Secure channel (AES-128 handshake, MAC chaining, encryption)
//! - File transfer and key rotation
//! - Async/await API using Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use osdp::{Bus, BusConfig, PeripheralConfig};
//! use osdp_core::Integrity;
//! use osdp_transport::TcpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> osdp::Result<()> {
//!     let config = BusConfig::builder()
//!         .peripheral(PeripheralConfig::plain(0x01))
//!         .integrity(Integrity::Crc16)
//!         .retries(3)
//!         .reply_timeout(Duration::from_millis(200))
//!         .build()?;
//!
//!     let transport = TcpTransport::new("10.0.0.50", 4001);
//!     let (mut bus, panel, mut events) = Bus::new(config, transport);
//!
//!     let shutdown = CancellationToken::new();
//!     let task = tokio::spawn({
//!         let shutdown = shutdown.clone();
//!         async move { bus.run(shutdown).await }
//!     });
//!
//!     panel.poll(0x01)?;
//!     if let Some(event) = events.recv().await {
//!         println!("{}", event);
//!     }
//!
//!     shutdown.cancel();
//!     let _ = task.await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod peripheral;

// Re-exports
pub use bus::{Bus, ControlPanel, Intent};
pub use config::{BusConfig, PeripheralConfig, Security};
pub use error::{Error, Result};
pub use peripheral::{ExchangeOutcome, PeripheralSession, SessionState};

// Re-export types
pub use osdp_types::{CommandFields, Event, EventKind, Reply};
