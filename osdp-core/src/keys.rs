//! Secure channel key material
//!
//! Keys live in [`Zeroizing`] buffers so their bytes are overwritten when
//! the owning secure channel drops them.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AES-128 key length
pub const KEY_SIZE: usize = 16;

/// Well-known default base key (SCBK-D) used while a peripheral is in install mode
const SCBK_D: [u8; KEY_SIZE] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];

/// 128-bit secret key, wiped on drop
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; KEY_SIZE]>);

impl SecretKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// The default base key SCBK-D
    pub fn install_mode() -> Self {
        Self::new(SCBK_D)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self::new(bytes))
    }

    /// Parse a key from 32 hex digits
    ///
    /// # Examples
    ///
    /// ```
    /// use osdp_core::keys::SecretKey;
    ///
    /// let key = SecretKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
    /// assert_eq!(key.as_bytes()[15], 0x0F);
    /// assert!(SecretKey::from_hex("0001").is_err());
    /// ```
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(text.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.as_bytes(), other.as_bytes())
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Session keys derived during the handshake
pub struct SessionKeys {
    /// S-ENC
    pub enc: SecretKey,
    /// S-MAC1
    pub mac1: SecretKey,
    /// S-MAC2
    pub mac2: SecretKey,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(<redacted>)")
    }
}

/// Compare two byte strings without early exit
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
