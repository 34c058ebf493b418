//! # osdp-core
//!
//! Core protocol implementation for OSDP controllers.
//!
//! This crate provides the low-level protocol primitives:
//! - Frame structure and encoding/decoding
//! - Checksum and CRC calculation
//! - Command and reply codes with their typed payloads
//! - Secure channel handshake, MAC and encryption
//! - Protocol constants

pub mod checksum;
pub mod command;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod keys;
pub mod registry;
pub mod secure;

pub use command::{CommandCode, ReplyCode};
pub use error::{Error, Result};
pub use frame::{Frame, FrameBuffer, FrameCodec, Integrity, SecurityBlock};
pub use keys::SecretKey;
pub use secure::{SecureChannel, SecureChannelState};

/// Protocol version information
pub const PROTOCOL_VERSION: &str = "2.2";
