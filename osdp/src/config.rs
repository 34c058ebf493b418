//! Bus configuration
//!
//! A [`BusConfig`] is built once, validated, and consumed by
//! [`Bus::new`](crate::Bus::new). Integrity mode, retry budget and reply
//! timeout have no defaults and must always be given.
//!
//! Configurations can also be loaded from a device profile file: JSON
//! with `//` and `/* */` comments and a top-level `"devices"` map.
//!
//! ```json
//! {
//!     "devices": {
//!         // bench reader behind a serial server
//!         "bench": {
//!             "port": "10.0.0.50:4001",
//!             "baud": 9600,
//!             "secure": true,
//!             "integrity": "crc",
//!             "retries": 3,
//!             "reply_timeout_ms": 200,
//!             "peripherals": [
//!                 { "address": 1, "key": "000102030405060708090a0b0c0d0e0f" }
//!             ]
//!         }
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::debug;

use osdp_core::{Integrity, SecretKey, constants::MAX_PERIPHERAL_ADDRESS};

/// Largest file transfer fragment accepted in configuration
pub const MAX_FRAGMENT_SIZE: usize = 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Duplicate peripheral address 0x{0:02X}")]
    DuplicateAddress(u8),

    #[error("Peripheral address 0x{0:02X} out of range (max 0x7E)")]
    AddressOutOfRange(u8),

    #[error("No peripherals configured")]
    NoPeripherals,

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error("Invalid key for 0x{address:02X}: {reason}")]
    InvalidKey { address: u8, reason: String },

    #[error("No configuration found for device: {0}")]
    UnknownProfile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Secure channel policy of one peripheral
#[derive(Debug, Clone)]
pub enum Security {
    /// No secure channel
    Plain,

    /// Secure channel with the given base key (SCBK)
    Secure {
        key: SecretKey,
        /// Keep talking in plaintext when the handshake fails
        allow_plaintext_fallback: bool,
    },

    /// Secure channel with the default key (SCBK-D), for commissioning
    Install { allow_plaintext_fallback: bool },
}

impl Security {
    pub fn is_secure(&self) -> bool {
        !matches!(self, Self::Plain)
    }

    pub fn allows_plaintext_fallback(&self) -> bool {
        match self {
            Self::Plain => true,
            Self::Secure {
                allow_plaintext_fallback,
                ..
            }
            | Self::Install {
                allow_plaintext_fallback,
            } => *allow_plaintext_fallback,
        }
    }
}

/// One configured peripheral
#[derive(Debug, Clone)]
pub struct PeripheralConfig {
    pub address: u8,
    pub security: Security,
}

impl PeripheralConfig {
    pub fn new(address: u8, security: Security) -> Self {
        Self { address, security }
    }

    /// Peripheral without secure channel
    pub fn plain(address: u8) -> Self {
        Self::new(address, Security::Plain)
    }
}

/// Validated bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    peripherals: Vec<PeripheralConfig>,
    integrity: Integrity,
    retries: u32,
    reply_timeout: Duration,
    idle_delay: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    handshake_cooldown: Duration,
    fragment_size: usize,
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }

    /// Peripherals in address order
    pub fn peripherals(&self) -> &[PeripheralConfig] {
        &self.peripherals
    }

    pub fn integrity(&self) -> Integrity {
        self.integrity
    }

    /// Resends allowed per exchange before the peripheral is faulted
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Pause between polling rounds
    pub fn idle_delay(&self) -> Duration {
        self.idle_delay
    }

    /// First backoff after a fault, doubled on every further fault
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn backoff_cap(&self) -> Duration {
        self.backoff_cap
    }

    /// Wait before retrying a failed handshake (plaintext fallback only)
    pub fn handshake_cooldown(&self) -> Duration {
        self.handshake_cooldown
    }

    /// Initial file transfer fragment size
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }
}

/// Builder for [`BusConfig`]
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use osdp::config::{BusConfig, PeripheralConfig};
/// use osdp_core::Integrity;
///
/// let config = BusConfig::builder()
///     .peripheral(PeripheralConfig::plain(0x01))
///     .integrity(Integrity::Crc16)
///     .retries(3)
///     .reply_timeout(Duration::from_millis(200))
///     .build()
///     .unwrap();
/// assert_eq!(config.peripherals().len(), 1);
///
/// // no reply timeout given
/// assert!(BusConfig::builder()
///     .peripheral(PeripheralConfig::plain(0x01))
///     .integrity(Integrity::Crc16)
///     .retries(3)
///     .build()
///     .is_err());
/// ```
#[derive(Debug, Clone)]
pub struct BusConfigBuilder {
    peripherals: Vec<PeripheralConfig>,
    integrity: Option<Integrity>,
    retries: Option<u32>,
    reply_timeout: Option<Duration>,
    idle_delay: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    handshake_cooldown: Duration,
    fragment_size: usize,
}

impl Default for BusConfigBuilder {
    fn default() -> Self {
        Self {
            peripherals: Vec::new(),
            integrity: None,
            retries: None,
            reply_timeout: None,
            idle_delay: Duration::from_millis(50),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            handshake_cooldown: Duration::from_secs(10),
            fragment_size: 128,
        }
    }
}

impl BusConfigBuilder {
    pub fn peripheral(mut self, peripheral: PeripheralConfig) -> Self {
        self.peripherals.push(peripheral);
        self
    }

    pub fn peripherals(mut self, peripherals: impl IntoIterator<Item = PeripheralConfig>) -> Self {
        self.peripherals.extend(peripherals);
        self
    }

    pub fn integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn handshake_cooldown(mut self, cooldown: Duration) -> Self {
        self.handshake_cooldown = cooldown;
        self
    }

    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns an error if a required setting is missing, no peripheral is
    /// configured, an address is out of range or configured twice, or a
    /// timing value is unusable.
    pub fn build(self) -> Result<BusConfig> {
        let integrity = self.integrity.ok_or(ConfigError::Missing("integrity"))?;
        let retries = self.retries.ok_or(ConfigError::Missing("retries"))?;
        let reply_timeout = self.reply_timeout.ok_or(ConfigError::Missing("reply_timeout"))?;

        if self.peripherals.is_empty() {
            return Err(ConfigError::NoPeripherals);
        }

        let mut seen = BTreeSet::new();
        for peripheral in &self.peripherals {
            if peripheral.address > MAX_PERIPHERAL_ADDRESS {
                return Err(ConfigError::AddressOutOfRange(peripheral.address));
            }
            if !seen.insert(peripheral.address) {
                return Err(ConfigError::DuplicateAddress(peripheral.address));
            }
        }

        if reply_timeout.is_zero() {
            return Err(ConfigError::Invalid("reply timeout must be non-zero".into()));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::Invalid(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        if self.fragment_size == 0 || self.fragment_size > MAX_FRAGMENT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "fragment size {} out of range 1..={}",
                self.fragment_size, MAX_FRAGMENT_SIZE
            )));
        }

        let mut peripherals = self.peripherals;
        peripherals.sort_by_key(|p| p.address);

        Ok(BusConfig {
            peripherals,
            integrity,
            retries,
            reply_timeout,
            idle_delay: self.idle_delay,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            handshake_cooldown: self.handshake_cooldown,
            fragment_size: self.fragment_size,
        })
    }
}

/// Integrity mode as written in profile files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityName {
    Checksum,
    Crc,
}

impl From<IntegrityName> for Integrity {
    fn from(name: IntegrityName) -> Self {
        match name {
            IntegrityName::Checksum => Integrity::Checksum,
            IntegrityName::Crc => Integrity::Crc16,
        }
    }
}

/// Peripheral entry of a device profile
#[derive(Debug, Clone, Deserialize)]
pub struct PeripheralProfile {
    pub address: u8,
    /// Base key as 32 hex digits
    #[serde(default)]
    pub key: Option<String>,
    /// Use the default key (SCBK-D)
    #[serde(default)]
    pub install: bool,
    #[serde(default)]
    pub allow_plaintext_fallback: bool,
}

/// One named device profile
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    /// Serial server endpoint (`host:port`)
    pub port: String,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub secure: bool,
    pub integrity: IntegrityName,
    pub retries: u32,
    pub reply_timeout_ms: u64,
    #[serde(default)]
    pub idle_delay_ms: Option<u64>,
    pub peripherals: Vec<PeripheralProfile>,
}

impl DeviceProfile {
    fn security(&self, peripheral: &PeripheralProfile) -> Result<Security> {
        let allow_plaintext_fallback = peripheral.allow_plaintext_fallback;

        if !self.secure {
            return Ok(Security::Plain);
        }
        if peripheral.install {
            return Ok(Security::Install {
                allow_plaintext_fallback,
            });
        }

        let text = peripheral.key.as_deref().ok_or(ConfigError::InvalidKey {
            address: peripheral.address,
            reason: "secure profile without key".into(),
        })?;
        let key = SecretKey::from_hex(text).map_err(|e| ConfigError::InvalidKey {
            address: peripheral.address,
            reason: e.to_string(),
        })?;

        Ok(Security::Secure {
            key,
            allow_plaintext_fallback,
        })
    }

    /// Host and TCP port of the serial server
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .port
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid(format!("port {:?} is not host:port", self.port)))?;
        let port = port
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid TCP port in {:?}", self.port)))?;

        Ok((host.to_string(), port))
    }

    /// Build and validate the bus configuration this profile describes
    pub fn bus_config(&self) -> Result<BusConfig> {
        let mut builder = BusConfig::builder()
            .integrity(self.integrity.into())
            .retries(self.retries)
            .reply_timeout(Duration::from_millis(self.reply_timeout_ms));

        if let Some(delay) = self.idle_delay_ms {
            builder = builder.idle_delay(Duration::from_millis(delay));
        }

        for peripheral in &self.peripherals {
            builder = builder.peripheral(PeripheralConfig::new(
                peripheral.address,
                self.security(peripheral)?,
            ));
        }

        builder.build()
    }
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    devices: BTreeMap<String, DeviceProfile>,
}

/// Remove `//` and `/* */` comments, leaving string literals intact
pub fn strip_comments(text: &str) -> Result<String> {
    let pattern = Regex::new(r#"("(?:[^"\\]|\\.)*")|//[^\n]*|/\*[\s\S]*?\*/"#)?;

    let stripped = pattern.replace_all(text, |caps: &Captures<'_>| {
        caps.get(1)
            .map(|literal| literal.as_str().to_string())
            .unwrap_or_default()
    });

    Ok(stripped.into_owned())
}

/// Parse all device profiles from commented JSON
pub fn parse_profiles(text: &str) -> Result<BTreeMap<String, DeviceProfile>> {
    let file: ProfileFile = serde_json::from_str(&strip_comments(text)?)?;
    Ok(file.devices)
}

/// Load all device profiles from a file
pub fn load_profiles(path: impl AsRef<Path>) -> Result<BTreeMap<String, DeviceProfile>> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Loading device profiles");

    let text = std::fs::read_to_string(path)?;
    parse_profiles(&text)
}

/// Load one named device profile from a file
///
/// # Errors
///
/// Returns `UnknownProfile` when the file has no device called `name`.
pub fn load_profile(path: impl AsRef<Path>, name: &str) -> Result<DeviceProfile> {
    load_profiles(path)?
        .remove(name)
        .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"
    {
        // two readers on one line
        "devices": {
            "lobby": {
                "port": "10.0.0.50:4001", /* serial server */
                "baud": 9600,
                "secure": true,
                "integrity": "crc",
                "retries": 3,
                "reply_timeout_ms": 200,
                "peripherals": [
                    { "address": 1, "key": "000102030405060708090a0b0c0d0e0f" },
                    { "address": 2, "install": true, "allow_plaintext_fallback": true }
                ]
            },
            "bench": {
                "port": "http://bench//serial",
                "integrity": "checksum",
                "retries": 1,
                "reply_timeout_ms": 100,
                "idle_delay_ms": 10,
                "peripherals": [ { "address": 5 } ]
            }
        }
    }
    "#;

    fn builder() -> BusConfigBuilder {
        BusConfig::builder()
            .integrity(Integrity::Crc16)
            .retries(2)
            .reply_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_builder_requires_policy_values() {
        let result = BusConfig::builder()
            .peripheral(PeripheralConfig::plain(1))
            .retries(2)
            .reply_timeout(Duration::from_millis(100))
            .build();
        assert!(matches!(result, Err(ConfigError::Missing("integrity"))));

        let result = BusConfig::builder()
            .peripheral(PeripheralConfig::plain(1))
            .integrity(Integrity::Checksum)
            .reply_timeout(Duration::from_millis(100))
            .build();
        assert!(matches!(result, Err(ConfigError::Missing("retries"))));
    }

    #[test]
    fn test_builder_rejects_bad_addresses() {
        let result = builder()
            .peripheral(PeripheralConfig::plain(1))
            .peripheral(PeripheralConfig::plain(1))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateAddress(1))));

        let result = builder().peripheral(PeripheralConfig::plain(0x7F)).build();
        assert!(matches!(result, Err(ConfigError::AddressOutOfRange(0x7F))));

        assert!(matches!(builder().build(), Err(ConfigError::NoPeripherals)));
    }

    #[test]
    fn test_builder_sorts_peripherals() {
        let config = builder()
            .peripherals([PeripheralConfig::plain(3), PeripheralConfig::plain(1)])
            .build()
            .unwrap();
        let addresses: Vec<u8> = config.peripherals().iter().map(|p| p.address).collect();
        assert_eq!(addresses, vec![1, 3]);
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = builder()
            .peripheral(PeripheralConfig::plain(1))
            .reply_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_strip_comments_keeps_strings() {
        let stripped = strip_comments(r#"{"a": "x//y", /* c */ "b": 1} // tail"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], "x//y");
        assert_eq!(value["b"], 1);
    }

    #[test]
    fn test_parse_profiles() {
        let profiles = parse_profiles(PROFILES).unwrap();
        assert_eq!(profiles.len(), 2);

        let bench = &profiles["bench"];
        assert_eq!(bench.port, "http://bench//serial");
        assert!(bench.endpoint().is_err());
        assert_eq!(
            profiles["lobby"].endpoint().unwrap(),
            ("10.0.0.50".to_string(), 4001)
        );

        let config = bench.bus_config().unwrap();
        assert_eq!(config.integrity(), Integrity::Checksum);
        assert_eq!(config.idle_delay(), Duration::from_millis(10));
        assert!(!config.peripherals()[0].security.is_secure());
    }

    #[test]
    fn test_secure_profile() {
        let profiles = parse_profiles(PROFILES).unwrap();
        let config = profiles["lobby"].bus_config().unwrap();

        match &config.peripherals()[0].security {
            Security::Secure { key, allow_plaintext_fallback } => {
                assert_eq!(key.as_bytes()[15], 0x0F);
                assert!(!allow_plaintext_fallback);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            config.peripherals()[1].security,
            Security::Install { allow_plaintext_fallback: true }
        ));
    }

    #[test]
    fn test_secure_profile_without_key() {
        let mut profile = parse_profiles(PROFILES).unwrap().remove("bench").unwrap();
        profile.secure = true;

        assert!(matches!(
            profile.bus_config(),
            Err(ConfigError::InvalidKey { address: 5, .. })
        ));
    }

    #[test]
    fn test_load_profile_unknown_name() {
        let path = std::env::temp_dir().join(format!("osdp-profiles-{}.json", std::process::id()));
        std::fs::write(&path, PROFILES).unwrap();

        assert!(load_profile(&path, "lobby").is_ok());
        assert!(matches!(
            load_profile(&path, "garage"),
            Err(ConfigError::UnknownProfile(name)) if name == "garage"
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
