//! Protocol constants

/// Start of message marker
pub const SOM: u8 = 0x53;

/// Optional line mark sent before SOM by some controllers
pub const MARK: u8 = 0xFF;

/// Address bit set on frames sent by a peripheral
pub const REPLY_FLAG: u8 = 0x80;

/// Broadcast address
pub const BROADCAST_ADDRESS: u8 = 0x7F;

/// Highest address a peripheral can be configured with
pub const MAX_PERIPHERAL_ADDRESS: u8 = 0x7E;

/// SOM + address + 2 length bytes + control
pub const HEADER_SIZE: usize = 5;

/// Maximum encoded frame length
pub const MAX_FRAME_SIZE: usize = 1440;

/// Length of the truncated MAC carried by secured frames
pub const MAC_SIZE: usize = 4;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Secure control block types
pub mod scb {
    /// CHLNG (command)
    pub const SCS_11: u8 = 0x11;

    /// CCRYPT (reply)
    pub const SCS_12: u8 = 0x12;

    /// SCRYPT (command)
    pub const SCS_13: u8 = 0x13;

    /// RMAC_I (reply)
    pub const SCS_14: u8 = 0x14;

    /// Command with MAC, data not encrypted
    pub const SCS_15: u8 = 0x15;

    /// Reply with MAC, data not encrypted
    pub const SCS_16: u8 = 0x16;

    /// Command with MAC, data encrypted
    pub const SCS_17: u8 = 0x17;

    /// Reply with MAC, data encrypted
    pub const SCS_18: u8 = 0x18;

    /// SCB data of CHLNG/SCRYPT selecting the default base key
    pub const KEY_SCBK_D: u8 = 0x00;

    /// SCB data of CHLNG/SCRYPT selecting the configured base key
    pub const KEY_SCBK: u8 = 0x01;

    /// SCB data of RMAC_I when the server cryptogram was accepted
    pub const CRYPTOGRAM_ACCEPTED: u8 = 0x01;

    /// Whether frames with this SCB type carry a MAC
    pub fn has_mac(kind: u8) -> bool {
        (SCS_15..=SCS_18).contains(&kind)
    }
}
