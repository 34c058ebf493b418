//! Typed command fields
//!
//! Each variant of [`CommandFields`] is the schema of one or more OSDP
//! command codes. The registry in `osdp-core` checks that the variant
//! matches the code being sent.

use std::fmt;

use bytes::Bytes;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Fields carried by an outgoing command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFields {
    /// No fields (POLL, ID, CAP, LSTAT, ISTAT, OSTAT, RSTAT)
    Empty,

    /// Output control records (OUT)
    Output(Vec<OutputControl>),

    /// LED control records (LED)
    Led(Vec<LedControl>),

    /// Buzzer control (BUZ)
    Buzzer(BuzzerControl),

    /// Text output (TEXT)
    Text(TextOutput),

    /// Communication settings (COMSET)
    ComSet(ComSettings),

    /// Secure channel base key (KEYSET)
    KeySet(KeySet),

    /// Controller random number RND.A (CHLNG)
    Challenge([u8; 8]),

    /// Server cryptogram (SCRYPT)
    ServerCryptogram([u8; 16]),

    /// Maximum receive buffer size of the controller (ACURXSIZE)
    AcuRxSize(u16),

    /// One file transfer fragment (FILETRANSFER)
    FileTransfer(FileFragment),

    /// Vendor specific command (MFG)
    Manufacturer(ManufacturerData),

    /// Keep-active time in milliseconds (KEEPACTIVE)
    KeepActive(u16),
}

impl CommandFields {
    /// Short name of the schema, used in error messages
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Output(_) => "output",
            Self::Led(_) => "led",
            Self::Buzzer(_) => "buzzer",
            Self::Text(_) => "text",
            Self::ComSet(_) => "comset",
            Self::KeySet(_) => "keyset",
            Self::Challenge(_) => "challenge",
            Self::ServerCryptogram(_) => "server-cryptogram",
            Self::AcuRxSize(_) => "acu-rx-size",
            Self::FileTransfer(_) => "file-transfer",
            Self::Manufacturer(_) => "manufacturer",
            Self::KeepActive(_) => "keep-active",
        }
    }
}

/// Output control record (4 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputControl {
    pub output: u8,
    /// 0 = NOP, 1/2 = permanent off/on abort timed, 3/4 = permanent off/on allow timed, 5/6 = temporary
    pub control_code: u8,
    /// Timer in units of 100 ms
    pub timer: u16,
}

/// LED colors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedColor {
    Black = 0,
    Red = 1,
    Green = 2,
    Amber = 3,
    Blue = 4,
    Magenta = 5,
    Cyan = 6,
    White = 7,
}

impl TryFrom<u8> for LedColor {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Black),
            1 => Ok(Self::Red),
            2 => Ok(Self::Green),
            3 => Ok(Self::Amber),
            4 => Ok(Self::Blue),
            5 => Ok(Self::Magenta),
            6 => Ok(Self::Cyan),
            7 => Ok(Self::White),
            _ => Err(Error::Parse(format!("invalid LED color {value}"))),
        }
    }
}

/// Temporary LED behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedTemporary {
    /// 0 = NOP, 1 = cancel, 2 = set
    pub control_code: u8,
    pub on_time: u8,
    pub off_time: u8,
    pub on_color: LedColor,
    pub off_color: LedColor,
    /// Duration in units of 100 ms
    pub timer: u16,
}

/// Permanent LED behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedPermanent {
    /// 0 = NOP, 1 = set
    pub control_code: u8,
    pub on_time: u8,
    pub off_time: u8,
    pub on_color: LedColor,
    pub off_color: LedColor,
}

/// LED control record (14 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedControl {
    pub reader: u8,
    pub led: u8,
    pub temporary: LedTemporary,
    pub permanent: LedPermanent,
}

impl LedControl {
    /// Steady permanent color, no temporary action
    pub fn steady(reader: u8, led: u8, color: LedColor) -> Self {
        Self {
            reader,
            led,
            temporary: LedTemporary {
                control_code: 0,
                on_time: 0,
                off_time: 0,
                on_color: LedColor::Black,
                off_color: LedColor::Black,
                timer: 0,
            },
            permanent: LedPermanent {
                control_code: 1,
                on_time: 1,
                off_time: 0,
                on_color: color,
                off_color: LedColor::Black,
            },
        }
    }
}

/// Buzzer control (5 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuzzerControl {
    pub reader: u8,
    /// 1 = off, 2 = default tone
    pub tone: u8,
    /// On time in units of 100 ms
    pub on_time: u8,
    /// Off time in units of 100 ms
    pub off_time: u8,
    /// 0 = repeat until told otherwise
    pub count: u8,
}

/// Text output request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextOutput {
    pub reader: u8,
    /// 1/2 = permanent (no wrap / wrap), 3/4 = temporary (no wrap / wrap)
    pub command: u8,
    /// Seconds a temporary text is shown
    pub temp_time: u8,
    pub row: u8,
    pub column: u8,
    text: String,
}

impl TextOutput {
    /// Maximum text length per record
    pub const MAX_LEN: usize = 32;

    /// Create a text output record
    ///
    /// Text must be printable ASCII and at most 32 characters.
    pub fn new(reader: u8, command: u8, row: u8, column: u8, text: impl Into<String>) -> Result<Self> {
        let text = text.into();

        if text.len() > Self::MAX_LEN {
            return Err(Error::Validation(format!(
                "text is {} characters (max {})",
                text.len(),
                Self::MAX_LEN
            )));
        }
        if !text.bytes().all(|b| (0x20..0x7F).contains(&b)) {
            return Err(Error::Validation("text must be printable ASCII".into()));
        }
        if !(1..=4).contains(&command) {
            return Err(Error::Validation(format!("invalid text command {command}")));
        }

        Ok(Self {
            reader,
            command,
            temp_time: 0,
            row,
            column,
            text,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Communication settings (COMSET command, COM reply)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComSettings {
    pub address: u8,
    pub baud_rate: u32,
}

impl ComSettings {
    pub fn new(address: u8, baud_rate: u32) -> Result<Self> {
        if address > 0x7E {
            return Err(Error::Validation(format!(
                "address 0x{address:02X} out of range (max 0x7E)"
            )));
        }
        Ok(Self { address, baud_rate })
    }
}

impl fmt::Display for ComSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Com[address: 0x{:02X}, baud: {}]", self.address, self.baud_rate)
    }
}

/// Secure channel base key transfer (KEYSET)
///
/// The key bytes are wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySet {
    /// 0x01 = secure channel base key
    pub key_type: u8,
    key: [u8; 16],
}

impl KeySet {
    pub const SCBK: u8 = 0x01;

    pub fn scbk(key: [u8; 16]) -> Self {
        Self {
            key_type: Self::SCBK,
            key,
        }
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }
}

impl Drop for KeySet {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("key_type", &self.key_type)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One fragment of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragment {
    pub file_type: u8,
    pub total_size: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// Vendor specific data (MFG command, MFGREP reply)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    /// IEEE OUI of the vendor
    pub vendor: [u8; 3],
    pub data: Bytes,
}

impl fmt::Display for ManufacturerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mfg[vendor: {}, data: {}]",
            hex::encode_upper(self.vendor),
            hex::encode_upper(&self.data)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_output_limits() {
        assert!(TextOutput::new(0, 1, 1, 1, "Hello").is_ok());
        assert!(TextOutput::new(0, 1, 1, 1, "x".repeat(33)).is_err());
        assert!(TextOutput::new(0, 1, 1, 1, "tab\there").is_err());
        assert!(TextOutput::new(0, 9, 1, 1, "ok").is_err());
    }

    #[test]
    fn test_com_settings_address_range() {
        assert!(ComSettings::new(0x7E, 9600).is_ok());
        assert!(ComSettings::new(0x7F, 9600).is_err());
    }

    #[test]
    fn test_keyset_debug_redacts_key() {
        let keyset = KeySet::scbk([0xAA; 16]);
        let debug = format!("{:?}", keyset);
        assert!(!debug.contains("170"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_led_color_conversion() {
        assert_eq!(LedColor::try_from(2).unwrap(), LedColor::Green);
        assert!(LedColor::try_from(8).is_err());
    }
}
