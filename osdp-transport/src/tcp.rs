//! TCP transport for RS-485 serial servers
//!
//! OSDP peripherals sit on an RS-485 multidrop line. Serial device servers
//! expose such a line as a raw TCP socket, so the byte stream is passed
//! through unchanged.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{error::*, Transport};

const READ_CHUNK: usize = 512;

/// TCP transport to a serial device server
pub struct TcpTransport {
    endpoint: String,
    peer: Option<SocketAddr>,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport for the serial server at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: format!("{}:{}", host.into(), port),
            peer: None,
            stream: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Drop bytes that arrived after the previous exchange gave up
    ///
    /// A late reply left in the socket would otherwise be taken as the
    /// answer to the next command.
    fn discard_stale(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::NotConnected);
        };

        let mut scratch = [0u8; READ_CHUNK];
        let mut discarded = 0;

        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => {
                    self.stream = None;
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if discarded > 0 {
            debug!(discarded, "Discarded stale bytes from {}", self.endpoint);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let peer = tokio::net::lookup_host(&self.endpoint)
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", self.endpoint, e)))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("No addresses found for {}", self.endpoint)))?;

        debug!("Connecting to serial server {}...", peer);

        let stream = timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        // Frames are small and latency bound
        stream.set_nodelay(true)?;

        debug!("Connected to {}", peer);

        self.peer = Some(peer);
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting from {}...", self.remote_addr());
            let _ = stream.shutdown().await;
        }

        self.peer = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.discard_stale()?;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!("TX {} bytes: {:02X?}", data.len(), &data[..data.len().min(16)]);

        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<BytesMut> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        let n = timeout(wait, stream.read_buf(&mut buf))
            .await
            .map_err(|_| Error::ReadTimeout)??;

        if n == 0 {
            self.stream = None;
            return Err(Error::ConnectionClosed);
        }

        trace!("RX {} bytes: {:02X?}", n, &buf[..n.min(16)]);

        Ok(buf)
    }

    fn remote_addr(&self) -> String {
        self.peer
            .map(|peer| peer.to_string())
            .unwrap_or_else(|| self.endpoint.clone())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!("Serial server connection {} dropped while open", self.endpoint);
        }
    }
}
