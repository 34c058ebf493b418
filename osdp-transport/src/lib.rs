//! Transport layer for OSDP
//!
//! The bus treats the line as an opaque byte pipe: bytes go out with
//! [`Transport::send`] and whatever arrives comes back from
//! [`Transport::receive`]. Frame boundaries are recovered by the caller.

pub mod error;
pub mod tcp;

pub use error::{Error, Result};
pub use tcp::TcpTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

/// Transport trait for different line types
#[async_trait]
pub trait Transport: Send {
    /// Open the line
    async fn connect(&mut self) -> Result<()>;

    /// Close the line
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send raw bytes
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive whatever bytes arrive within `timeout`
    ///
    /// Returns `Error::ReadTimeout` when nothing arrived. A successful
    /// read may hold a partial frame or several frames.
    async fn receive(&mut self, timeout: Duration) -> Result<BytesMut>;

    /// Get remote address
    fn remote_addr(&self) -> String;
}
