//! OSDP command and reply codes

use std::fmt;

use crate::error::{Error, Result};

/// Command codes (controller to peripheral)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    Poll = 0x60,
    Id = 0x61,
    Cap = 0x62,
    LocalStatus = 0x64,
    InputStatus = 0x65,
    OutputStatus = 0x66,
    ReaderStatus = 0x67,
    Output = 0x68,
    Led = 0x69,
    Buzzer = 0x6A,
    Text = 0x6B,
    ComSet = 0x6E,
    KeySet = 0x75,
    Challenge = 0x76,
    ServerCryptogram = 0x77,
    AcuRxSize = 0x7B,
    FileTransfer = 0x7C,
    Manufacturer = 0x80,
    KeepActive = 0xA7,
}

impl CommandCode {
    /// Check if this command is part of the secure channel handshake
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Challenge | Self::ServerCryptogram)
    }

    /// Get command name
    pub fn name(self) -> &'static str {
        match self {
            Self::Poll => "osdp_POLL",
            Self::Id => "osdp_ID",
            Self::Cap => "osdp_CAP",
            Self::LocalStatus => "osdp_LSTAT",
            Self::InputStatus => "osdp_ISTAT",
            Self::OutputStatus => "osdp_OSTAT",
            Self::ReaderStatus => "osdp_RSTAT",
            Self::Output => "osdp_OUT",
            Self::Led => "osdp_LED",
            Self::Buzzer => "osdp_BUZ",
            Self::Text => "osdp_TEXT",
            Self::ComSet => "osdp_COMSET",
            Self::KeySet => "osdp_KEYSET",
            Self::Challenge => "osdp_CHLNG",
            Self::ServerCryptogram => "osdp_SCRYPT",
            Self::AcuRxSize => "osdp_ACURXSIZE",
            Self::FileTransfer => "osdp_FILETRANSFER",
            Self::Manufacturer => "osdp_MFG",
            Self::KeepActive => "osdp_KEEPACTIVE",
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x60 => Ok(Self::Poll),
            0x61 => Ok(Self::Id),
            0x62 => Ok(Self::Cap),
            0x64 => Ok(Self::LocalStatus),
            0x65 => Ok(Self::InputStatus),
            0x66 => Ok(Self::OutputStatus),
            0x67 => Ok(Self::ReaderStatus),
            0x68 => Ok(Self::Output),
            0x69 => Ok(Self::Led),
            0x6A => Ok(Self::Buzzer),
            0x6B => Ok(Self::Text),
            0x6E => Ok(Self::ComSet),
            0x75 => Ok(Self::KeySet),
            0x76 => Ok(Self::Challenge),
            0x77 => Ok(Self::ServerCryptogram),
            0x7B => Ok(Self::AcuRxSize),
            0x7C => Ok(Self::FileTransfer),
            0x80 => Ok(Self::Manufacturer),
            0xA7 => Ok(Self::KeepActive),
            _ => Err(Error::UnknownCommandCode(value)),
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

/// Reply codes (peripheral to controller)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    Ack = 0x40,
    Nak = 0x41,
    PdId = 0x45,
    PdCap = 0x46,
    LocalStatus = 0x48,
    InputStatus = 0x49,
    OutputStatus = 0x4A,
    ReaderStatus = 0x4B,
    Raw = 0x50,
    Formatted = 0x51,
    Keypad = 0x53,
    Com = 0x54,
    ClientCryptogram = 0x76,
    InitialRmac = 0x78,
    Busy = 0x79,
    FileTransferStatus = 0x7A,
    Manufacturer = 0x90,
}

impl ReplyCode {
    /// Check if this reply is part of the secure channel handshake
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::ClientCryptogram | Self::InitialRmac)
    }

    /// Get reply name
    pub fn name(self) -> &'static str {
        match self {
            Self::Ack => "osdp_ACK",
            Self::Nak => "osdp_NAK",
            Self::PdId => "osdp_PDID",
            Self::PdCap => "osdp_PDCAP",
            Self::LocalStatus => "osdp_LSTATR",
            Self::InputStatus => "osdp_ISTATR",
            Self::OutputStatus => "osdp_OSTATR",
            Self::ReaderStatus => "osdp_RSTATR",
            Self::Raw => "osdp_RAW",
            Self::Formatted => "osdp_FMT",
            Self::Keypad => "osdp_KEYPAD",
            Self::Com => "osdp_COM",
            Self::ClientCryptogram => "osdp_CCRYPT",
            Self::InitialRmac => "osdp_RMAC_I",
            Self::Busy => "osdp_BUSY",
            Self::FileTransferStatus => "osdp_FTSTAT",
            Self::Manufacturer => "osdp_MFGREP",
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x40 => Ok(Self::Ack),
            0x41 => Ok(Self::Nak),
            0x45 => Ok(Self::PdId),
            0x46 => Ok(Self::PdCap),
            0x48 => Ok(Self::LocalStatus),
            0x49 => Ok(Self::InputStatus),
            0x4A => Ok(Self::OutputStatus),
            0x4B => Ok(Self::ReaderStatus),
            0x50 => Ok(Self::Raw),
            0x51 => Ok(Self::Formatted),
            0x53 => Ok(Self::Keypad),
            0x54 => Ok(Self::Com),
            0x76 => Ok(Self::ClientCryptogram),
            0x78 => Ok(Self::InitialRmac),
            0x79 => Ok(Self::Busy),
            0x7A => Ok(Self::FileTransferStatus),
            0x90 => Ok(Self::Manufacturer),
            _ => Err(Error::UnknownReplyCode(value)),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(u8::from(CommandCode::Poll), 0x60);
        assert_eq!(CommandCode::try_from(0x60).unwrap(), CommandCode::Poll);
        assert_eq!(CommandCode::try_from(0xA7).unwrap(), CommandCode::KeepActive);
    }

    #[test]
    fn test_reply_conversion() {
        assert_eq!(u8::from(ReplyCode::PdId), 0x45);
        assert_eq!(ReplyCode::try_from(0x79).unwrap(), ReplyCode::Busy);
    }

    #[test]
    fn test_unknown_codes() {
        assert!(matches!(
            CommandCode::try_from(0x01),
            Err(Error::UnknownCommandCode(0x01))
        ));
        assert!(matches!(
            ReplyCode::try_from(0x01),
            Err(Error::UnknownReplyCode(0x01))
        ));
    }

    #[test]
    fn test_handshake_codes() {
        assert!(CommandCode::Challenge.is_handshake());
        assert!(!CommandCode::Poll.is_handshake());
        assert!(ReplyCode::InitialRmac.is_handshake());
        assert!(!ReplyCode::Ack.is_handshake());
    }
}
