//! Typed reply payloads

use std::fmt;

use bytes::Bytes;

use crate::command::{ComSettings, ManufacturerData};

/// Decoded reply from a peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// General acknowledge (osdp_ACK)
    Ack,

    /// Negative acknowledge (osdp_NAK)
    Nak(NakReason),

    /// Device identification report (osdp_PDID)
    PdId(PdId),

    /// Device capabilities report (osdp_PDCAP)
    Capabilities(Vec<Capability>),

    /// Local status report (osdp_LSTATR)
    LocalStatus(LocalStatus),

    /// Input status report (osdp_ISTATR)
    InputStatus(Vec<bool>),

    /// Output status report (osdp_OSTATR)
    OutputStatus(Vec<bool>),

    /// Reader tamper status report (osdp_RSTATR)
    ReaderStatus(Vec<u8>),

    /// Raw card data (osdp_RAW)
    RawCard(CardRead),

    /// Formatted card data (osdp_FMT)
    FormattedCard(FormattedCard),

    /// Keypad data (osdp_KEYPAD)
    Keypad(KeypadData),

    /// Communication configuration report (osdp_COM)
    Com(ComSettings),

    /// Peripheral busy, resend later (osdp_BUSY)
    Busy,

    /// Vendor specific reply (osdp_MFGREP)
    Manufacturer(ManufacturerData),

    /// File transfer status (osdp_FTSTAT)
    FileTransferStatus(FileTransferStatus),

    /// Client cryptogram and random number (osdp_CCRYPT)
    ClientCryptogram(ClientCryptogram),

    /// Initial R-MAC (osdp_RMAC_I)
    InitialRmac([u8; 16]),
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Nak(_) => "NAK",
            Self::PdId(_) => "PDID",
            Self::Capabilities(_) => "PDCAP",
            Self::LocalStatus(_) => "LSTATR",
            Self::InputStatus(_) => "ISTATR",
            Self::OutputStatus(_) => "OSTATR",
            Self::ReaderStatus(_) => "RSTATR",
            Self::RawCard(_) => "RAW",
            Self::FormattedCard(_) => "FMT",
            Self::Keypad(_) => "KEYPAD",
            Self::Com(_) => "COM",
            Self::Busy => "BUSY",
            Self::Manufacturer(_) => "MFGREP",
            Self::FileTransferStatus(_) => "FTSTAT",
            Self::ClientCryptogram(_) => "CCRYPT",
            Self::InitialRmac(_) => "RMAC_I",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nak(reason) => write!(f, "NAK({})", reason),
            Self::PdId(id) => write!(f, "{}", id),
            Self::LocalStatus(status) => write!(f, "{}", status),
            Self::RawCard(card) => write!(f, "{}", card),
            Self::Com(com) => write!(f, "{}", com),
            Self::Manufacturer(mfg) => write!(f, "{}", mfg),
            Self::Keypad(keys) => write!(f, "KEYPAD[reader: {}, digits: {}]", keys.reader, keys.digits.len()),
            other => f.write_str(other.name()),
        }
    }
}

/// NAK error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    None,
    MessageCheck,
    CommandLength,
    UnknownCommand,
    SequenceNumber,
    SecureChannelUnsupported,
    SecurityConditionNotMet,
    BioTypeUnsupported,
    BioFormatUnsupported,
    RecordFailure,
    Other(u8),
}

impl NakReason {
    /// Whether the peripheral rejected the message for secure channel reasons
    pub fn is_security_related(self) -> bool {
        matches!(
            self,
            Self::SecureChannelUnsupported | Self::SecurityConditionNotMet
        )
    }
}

impl From<u8> for NakReason {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::MessageCheck,
            2 => Self::CommandLength,
            3 => Self::UnknownCommand,
            4 => Self::SequenceNumber,
            5 => Self::SecureChannelUnsupported,
            6 => Self::SecurityConditionNotMet,
            7 => Self::BioTypeUnsupported,
            8 => Self::BioFormatUnsupported,
            9 => Self::RecordFailure,
            other => Self::Other(other),
        }
    }
}

impl From<NakReason> for u8 {
    fn from(reason: NakReason) -> u8 {
        match reason {
            NakReason::None => 0,
            NakReason::MessageCheck => 1,
            NakReason::CommandLength => 2,
            NakReason::UnknownCommand => 3,
            NakReason::SequenceNumber => 4,
            NakReason::SecureChannelUnsupported => 5,
            NakReason::SecurityConditionNotMet => 6,
            NakReason::BioTypeUnsupported => 7,
            NakReason::BioFormatUnsupported => 8,
            NakReason::RecordFailure => 9,
            NakReason::Other(code) => code,
        }
    }
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("no error"),
            Self::MessageCheck => f.write_str("message check failed"),
            Self::CommandLength => f.write_str("command length error"),
            Self::UnknownCommand => f.write_str("unknown command"),
            Self::SequenceNumber => f.write_str("sequence number error"),
            Self::SecureChannelUnsupported => f.write_str("secure channel unsupported"),
            Self::SecurityConditionNotMet => f.write_str("security condition not met"),
            Self::BioTypeUnsupported => f.write_str("biometric type unsupported"),
            Self::BioFormatUnsupported => f.write_str("biometric format unsupported"),
            Self::RecordFailure => f.write_str("unable to process record"),
            Self::Other(code) => write!(f, "error 0x{:02X}", code),
        }
    }
}

/// Device identification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdId {
    /// IEEE OUI of the vendor
    pub vendor_code: [u8; 3],
    pub model: u8,
    pub version: u8,
    pub serial_number: u32,
    /// Firmware major, minor, build
    pub firmware: (u8, u8, u8),
}

impl fmt::Display for PdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PdId[vendor: {}, model: {}, version: {}, SN: {:08X}, FW: {}.{}.{}]",
            hex::encode_upper(self.vendor_code),
            self.model,
            self.version,
            self.serial_number,
            self.firmware.0,
            self.firmware.1,
            self.firmware.2
        )
    }
}

/// One capability record of a PDCAP report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub function: u8,
    pub compliance: u8,
    pub count: u8,
}

impl Capability {
    pub const CHECK_CHARACTER: u8 = 8;
    pub const COMMUNICATION_SECURITY: u8 = 9;
    pub const RECEIVE_BUFFER_SIZE: u8 = 10;
    pub const LARGEST_MESSAGE_SIZE: u8 = 11;
}

/// Local status (tamper and power)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStatus {
    pub tamper: bool,
    pub power_failure: bool,
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LocalStatus[tamper: {}, power failure: {}]",
            self.tamper, self.power_failure
        )
    }
}

/// Raw card read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRead {
    pub reader: u8,
    /// 0 = unspecified raw bits, 1 = Wiegand
    pub format: u8,
    pub bit_count: u16,
    pub data: Bytes,
}

impl fmt::Display for CardRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Card[reader: {}, bits: {}, data: {}]",
            self.reader,
            self.bit_count,
            hex::encode_upper(&self.data)
        )
    }
}

/// Formatted (ASCII) card read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedCard {
    pub reader: u8,
    /// 0 = forward read, 1 = reverse read
    pub direction: u8,
    pub data: String,
}

/// Keypad digits entered on a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypadData {
    pub reader: u8,
    pub digits: Bytes,
}

/// File transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransferStatus {
    /// Bit 0 = interleave allowed, bit 1 = leave secure channel, bit 2 = poll response available
    pub action: u8,
    /// Requested delay before the next fragment, in milliseconds
    pub delay_ms: u16,
    pub status: i16,
    /// Preferred maximum fragment message size, 0 = no preference
    pub update_msg_max: u16,
}

impl FileTransferStatus {
    pub const OK: i16 = 0;
    pub const PROCESSED: i16 = 1;
    pub const REBOOTING: i16 = 2;
    pub const FINISHING: i16 = 3;

    /// A negative status aborts the transfer
    pub fn is_error(&self) -> bool {
        self.status < 0
    }

    /// The peripheral has accepted the whole file
    pub fn is_done(&self) -> bool {
        matches!(self.status, Self::PROCESSED | Self::REBOOTING)
    }

    pub fn is_finishing(&self) -> bool {
        self.status == Self::FINISHING
    }
}

/// Client cryptogram message of the secure channel handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCryptogram {
    pub client_uid: [u8; 8],
    pub rnd_b: [u8; 8],
    pub cryptogram: [u8; 16],
}
