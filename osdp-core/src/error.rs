//! Error types for osdp-core

/// Result type alias for osdp-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame structure is invalid (length, SOM, security block)
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Checksum or CRC verification failed
    #[error("Checksum mismatch: expected 0x{expected:04X}, received 0x{received:04X}")]
    ChecksumMismatch {
        expected: u16,
        received: u16,
    },

    /// Frame addressed to/from a peripheral that is not configured
    #[error("Unknown address: 0x{0:02X}")]
    UnknownAddress(u8),

    /// Reply came from a different peripheral than the one addressed
    #[error("Address mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    AddressMismatch {
        expected: u8,
        actual: u8,
    },

    /// Command fields do not match the schema of the command code
    #[error("Schema mismatch for command 0x{code:02X}: {reason}")]
    SchemaMismatch {
        code: u8,
        reason: String,
    },

    /// Unknown command code
    #[error("Unknown command code: 0x{0:02X}")]
    UnknownCommandCode(u8),

    /// Unknown reply code
    #[error("Unknown reply code: 0x{0:02X}")]
    UnknownReplyCode(u8),

    /// Reply payload shorter than its schema requires
    #[error("Truncated payload for reply 0x{code:02X}: expected at least {expected} bytes, got {actual}")]
    TruncatedPayload {
        code: u8,
        expected: usize,
        actual: usize,
    },

    /// Reply code is not acceptable for the command that was sent
    #[error("Unexpected reply 0x{reply:02X} to command 0x{command:02X}")]
    UnexpectedReply {
        command: u8,
        reply: u8,
    },

    /// Secure channel handshake failed
    #[error("Secure channel handshake failed: {0}")]
    HandshakeFailed(String),

    /// MAC verification failed on a secured frame
    #[error("MAC verification failed")]
    MacMismatch,

    /// Replayed or out-of-order secured frame
    #[error("Replay detected: sequence {sequence} not after last accepted {last_accepted}")]
    ReplayDetected {
        sequence: u64,
        last_accepted: u64,
    },

    /// Key material has the wrong length or encoding
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Operation not allowed in the current secure channel state
    #[error("Invalid secure channel state: {0}")]
    InvalidSecureState(String),

    /// No reply within the reply timeout
    #[error("Timeout waiting for reply after {millis}ms")]
    Timeout {
        millis: u64,
    },

    /// Payload too large
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },
}

impl Error {
    /// Check if error is recoverable (retrying the exchange might succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::MalformedFrame(_)
                | Self::ChecksumMismatch { .. }
                | Self::AddressMismatch { .. }
                | Self::UnknownAddress(_)
                | Self::TruncatedPayload { .. }
        )
    }

    /// Check if error tears down an established secure session
    pub fn breaks_session(&self) -> bool {
        matches!(
            self,
            Self::MacMismatch | Self::ReplayDetected { .. } | Self::HandshakeFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::Timeout { millis: 200 }.is_recoverable());
        assert!(Error::ChecksumMismatch { expected: 1, received: 2 }.is_recoverable());
        assert!(!Error::MacMismatch.is_recoverable());
        assert!(!Error::UnexpectedReply { command: 0x61, reply: 0x40 }.is_recoverable());

        assert!(Error::ReplayDetected { sequence: 1, last_accepted: 2 }.breaks_session());
        assert!(!Error::Timeout { millis: 200 }.breaks_session());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnexpectedReply { command: 0x61, reply: 0x40 };
        assert_eq!(err.to_string(), "Unexpected reply 0x40 to command 0x61");
    }
}
