//! Bus events surfaced to the console layer

use std::fmt;

use chrono::{DateTime, Utc};

use crate::reply::Reply;

/// Something that happened on one peripheral address
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub address: u8,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(address: u8, kind: EventKind) -> Self {
        Self {
            address,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Event kinds
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Secure channel challenge sent
    HandshakeStarted,

    /// Secure channel established
    SessionEstablished,

    /// Secure channel handshake failed
    HandshakeFailed(String),

    /// Established secure channel torn down (MAC failure, security NAK, ...)
    SessionBroken(String),

    /// Expected reply decoded
    ReplyReceived(Reply),

    /// Reply code not acceptable for the command sent
    UnexpectedReply { command: u8, reply: u8 },

    /// No reply within the reply timeout
    Timeout,

    /// Replayed or out-of-order secure frame
    ReplayDetected,

    /// Retry budget exhausted
    Faulted(String),

    /// Session restarted (sequence and secure channel reset)
    Reset,

    /// New secure channel base key accepted by the peripheral
    KeyRotated,

    /// File transfer accepted by the peripheral
    FileTransferComplete,

    /// File transfer aborted with the given status
    FileTransferAborted(i16),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] 0x{:02X} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.address,
            self.kind
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeStarted => f.write_str("handshake started"),
            Self::SessionEstablished => f.write_str("secure session established"),
            Self::HandshakeFailed(reason) => write!(f, "handshake failed: {}", reason),
            Self::SessionBroken(reason) => write!(f, "secure session broken: {}", reason),
            Self::ReplyReceived(reply) => write!(f, "reply {}", reply),
            Self::UnexpectedReply { command, reply } => write!(
                f,
                "unexpected reply 0x{:02X} to command 0x{:02X}",
                reply, command
            ),
            Self::Timeout => f.write_str("timeout"),
            Self::ReplayDetected => f.write_str("replay detected"),
            Self::Faulted(reason) => write!(f, "faulted: {}", reason),
            Self::Reset => f.write_str("reset"),
            Self::KeyRotated => f.write_str("key rotated"),
            Self::FileTransferComplete => f.write_str("file transfer complete"),
            Self::FileTransferAborted(status) => write!(f, "file transfer aborted ({})", status),
        }
    }
}
