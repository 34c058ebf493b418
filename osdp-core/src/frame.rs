//! OSDP frame structure and encoding/decoding

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{
    checksum,
    constants::{scb, BROADCAST_ADDRESS, HEADER_SIZE, MAC_SIZE, MAX_FRAME_SIZE, REPLY_FLAG, SOM},
    error::{Error, Result},
};

bitflags! {
    /// Flag bits of the control byte (bits 0-1 hold the sequence number)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u8 {
        /// Frame ends with a CRC-16 instead of an 8-bit checksum
        const CRC = 0x04;
        /// Security control block present
        const SCB = 0x08;
    }
}

const SEQUENCE_MASK: u8 = 0x03;

/// Smallest possible frame: header, code byte, checksum
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;

/// Integrity check carried at the end of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Integrity {
    /// 8-bit two's complement checksum
    Checksum,
    /// CRC-16/AUG-CCITT
    Crc16,
}

impl Integrity {
    /// Number of trailing check bytes
    pub fn size(self) -> usize {
        match self {
            Self::Checksum => 1,
            Self::Crc16 => 2,
        }
    }
}

/// Security control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    /// SCB type (SCS_11 ..= SCS_18)
    pub kind: u8,
    pub data: Bytes,
}

impl SecurityBlock {
    pub fn new(kind: u8, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Encoded size including the length and type bytes
    pub fn size(&self) -> usize {
        2 + self.data.len()
    }

    pub fn has_mac(&self) -> bool {
        scb::has_mac(self.kind)
    }
}

/// OSDP frame
///
/// # Frame Structure
///
/// ```text
/// ┌─────┬──────┬──────────┬──────┬─────────┬──────┬────────┬───────┬──────────┐
/// │ SOM │ ADDR │  LENGTH  │ CTRL │   SCB   │ CODE │  DATA  │  MAC  │ CKSUM/CRC│
/// │ 53  │  1   │ 2 (LE)   │  1   │ 0 or N  │  1   │ N      │ 0 / 4 │  1 / 2   │
/// └─────┴──────┴──────────┴──────┴─────────┴──────┴────────┴───────┴──────────┘
/// ```
///
/// LENGTH covers the whole frame from SOM through the check bytes.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use osdp_core::frame::{Frame, Integrity};
///
/// let frame = Frame::new(0x01, 1, Integrity::Crc16, 0x60, Bytes::new());
/// let encoded = frame.encode().unwrap();
/// let decoded = Frame::decode(&encoded).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Peripheral address (0x00 ..= 0x7F)
    pub address: u8,

    /// Set on frames sent by a peripheral (address bit 7)
    pub reply: bool,

    /// Sequence number (0 ..= 3)
    pub sequence: u8,

    /// Checksum or CRC
    pub integrity: Integrity,

    /// Security control block
    pub security: Option<SecurityBlock>,

    /// Command or reply code
    pub code: u8,

    /// Command or reply data
    pub data: Bytes,

    /// Truncated MAC, present for SCB types 0x15 ..= 0x18
    pub mac: Option<[u8; MAC_SIZE]>,
}

impl Frame {
    /// Create a command frame without a security block
    pub fn new(address: u8, sequence: u8, integrity: Integrity, code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            reply: false,
            sequence,
            integrity,
            security: None,
            code,
            data: data.into(),
            mac: None,
        }
    }

    /// Create a reply frame (address bit 7 set)
    pub fn reply(address: u8, sequence: u8, integrity: Integrity, code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            reply: true,
            ..Self::new(address, sequence, integrity, code, data)
        }
    }

    /// Attach a security control block
    pub fn with_security(mut self, block: SecurityBlock) -> Self {
        self.security = Some(block);
        self
    }

    /// Whether this frame carries a MAC
    pub fn is_secured(&self) -> bool {
        self.security.as_ref().is_some_and(SecurityBlock::has_mac)
    }

    /// SCB type, if any
    pub fn security_kind(&self) -> Option<u8> {
        self.security.as_ref().map(|block| block.kind)
    }

    /// Get total encoded frame size
    pub fn size(&self) -> usize {
        HEADER_SIZE
            + self.security.as_ref().map_or(0, SecurityBlock::size)
            + 1
            + self.data.len()
            + if self.is_secured() { MAC_SIZE } else { 0 }
            + self.integrity.size()
    }

    fn control_byte(&self) -> u8 {
        let mut flags = ControlFlags::empty();
        if self.integrity == Integrity::Crc16 {
            flags |= ControlFlags::CRC;
        }
        if self.security.is_some() {
            flags |= ControlFlags::SCB;
        }
        flags.bits() | (self.sequence & SEQUENCE_MASK)
    }

    fn validate(&self) -> Result<()> {
        if self.address > BROADCAST_ADDRESS {
            return Err(Error::MalformedFrame(format!(
                "address 0x{:02X} does not fit in 7 bits",
                self.address
            )));
        }
        if self.sequence > SEQUENCE_MASK {
            return Err(Error::MalformedFrame(format!(
                "sequence number {} out of range",
                self.sequence
            )));
        }
        if let Some(block) = &self.security {
            if block.size() > u8::MAX as usize {
                return Err(Error::MalformedFrame("security block too long".into()));
            }
        }
        if self.is_secured() != self.mac.is_some() {
            return Err(Error::MalformedFrame(
                "MAC presence does not match the security block type".into(),
            ));
        }
        if self.size() > MAX_FRAME_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.size(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Bytes covered by the MAC: SOM through the end of data
    ///
    /// The length field already accounts for the MAC and check bytes.
    pub fn authenticated_bytes(&self) -> Result<BytesMut> {
        self.validate_header()?;

        let total_size = self.size();
        let mut buf = BytesMut::with_capacity(total_size);

        let address = if self.reply {
            self.address | REPLY_FLAG
        } else {
            self.address
        };

        buf.put_u8(SOM);
        buf.put_u8(address);
        buf.put_u16_le(total_size as u16);
        buf.put_u8(self.control_byte());

        if let Some(block) = &self.security {
            buf.put_u8(block.size() as u8);
            buf.put_u8(block.kind);
            buf.put_slice(&block.data);
        }

        buf.put_u8(self.code);
        buf.put_slice(&self.data);

        Ok(buf)
    }

    // Everything except the MAC/SCB consistency, which is only settled
    // once the MAC has been computed
    fn validate_header(&self) -> Result<()> {
        let mut candidate = self.clone();
        candidate.mac = if self.is_secured() { Some([0; MAC_SIZE]) } else { None };
        candidate.validate()
    }

    /// Encode frame to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the address or sequence number are out of range,
    /// the MAC does not match the security block, or the frame exceeds
    /// the maximum frame size.
    pub fn encode(&self) -> Result<BytesMut> {
        self.validate()?;

        let mut buf = self.authenticated_bytes()?;

        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        match self.integrity {
            Integrity::Checksum => {
                let cs = checksum::checksum8(&buf);
                buf.put_u8(cs);
            }
            Integrity::Crc16 => {
                let crc = checksum::crc16(&buf);
                buf.put_u16_le(crc);
            }
        }

        trace!(len = buf.len(), "Encoded {}", self);

        Ok(buf)
    }

    /// Decode a complete frame
    ///
    /// Pure: the address is not checked against any configured set
    /// (see [`FrameCodec::decode`]).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer does not start with SOM or is shorter than a frame
    /// - The declared length differs from the buffer length
    /// - Checksum/CRC verification fails
    /// - The security block or MAC does not fit in the frame
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MIN_FRAME_SIZE {
            return Err(Error::MalformedFrame(format!(
                "frame too short: expected at least {} bytes, got {}",
                MIN_FRAME_SIZE,
                buf.len()
            )));
        }

        let mut header = &buf[..HEADER_SIZE];
        let som = header.get_u8();
        let address_byte = header.get_u8();
        let declared_len = header.get_u16_le() as usize;
        let control = header.get_u8();

        if som != SOM {
            return Err(Error::MalformedFrame(format!("missing SOM, found 0x{:02X}", som)));
        }
        if declared_len != buf.len() {
            return Err(Error::MalformedFrame(format!(
                "declared length {} but received {} bytes",
                declared_len,
                buf.len()
            )));
        }

        let flags = ControlFlags::from_bits(control & !SEQUENCE_MASK).ok_or_else(|| {
            Error::MalformedFrame(format!("unsupported control bits 0x{:02X}", control))
        })?;
        let integrity = if flags.contains(ControlFlags::CRC) {
            Integrity::Crc16
        } else {
            Integrity::Checksum
        };

        // Verify checksum before trusting anything else in the frame
        let body_end = buf.len() - integrity.size();
        let body = &buf[..body_end];
        match integrity {
            Integrity::Checksum => {
                let received = buf[body_end];
                if !checksum::verify_checksum8(body, received) {
                    return Err(Error::ChecksumMismatch {
                        expected: checksum::checksum8(body) as u16,
                        received: received as u16,
                    });
                }
            }
            Integrity::Crc16 => {
                let received = LittleEndian::read_u16(&buf[body_end..]);
                if !checksum::verify_crc16(body, received) {
                    return Err(Error::ChecksumMismatch {
                        expected: checksum::crc16(body),
                        received,
                    });
                }
            }
        }

        let mut pos = HEADER_SIZE;

        let security = if flags.contains(ControlFlags::SCB) {
            let scb_len = body[pos] as usize;
            if scb_len < 2 || pos + scb_len >= body_end {
                return Err(Error::MalformedFrame(format!(
                    "invalid security block length {}",
                    scb_len
                )));
            }
            let block = SecurityBlock::new(
                body[pos + 1],
                Bytes::copy_from_slice(&body[pos + 2..pos + scb_len]),
            );
            pos += scb_len;
            Some(block)
        } else {
            None
        };

        let mac_len = if security.as_ref().is_some_and(SecurityBlock::has_mac) {
            MAC_SIZE
        } else {
            0
        };
        if pos + 1 + mac_len > body_end {
            return Err(Error::MalformedFrame("frame too short for code and MAC".into()));
        }

        let code = body[pos];
        let data_end = body_end - mac_len;
        let data = Bytes::copy_from_slice(&body[pos + 1..data_end]);
        let mac = if mac_len > 0 {
            let mut mac = [0u8; MAC_SIZE];
            mac.copy_from_slice(&body[data_end..body_end]);
            Some(mac)
        } else {
            None
        };

        Ok(Self {
            address: address_byte & !REPLY_FLAG,
            reply: address_byte & REPLY_FLAG != 0,
            sequence: control & SEQUENCE_MASK,
            integrity,
            security,
            code,
            data,
            mac,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("address", &format!("0x{:02X}", self.address))
            .field("reply", &self.reply)
            .field("sequence", &self.sequence)
            .field("integrity", &self.integrity)
            .field("scb", &self.security_kind().map(|k| format!("0x{:02X}", k)))
            .field("code", &format!("0x{:02X}", self.code))
            .field("data_len", &self.data.len())
            .field("mac", &self.mac.map(hex::encode))
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame[0x{:02X}](addr=0x{:02X}{}, sqn={}, len={}{})",
            self.code,
            self.address,
            if self.reply { ", reply" } else { "" },
            self.sequence,
            self.data.len(),
            if self.is_secured() { ", secured" } else { "" }
        )
    }
}

/// Frame codec bound to the set of configured peripheral addresses
#[derive(Debug, Clone)]
pub struct FrameCodec {
    addresses: BTreeSet<u8>,
}

impl FrameCodec {
    pub fn new(addresses: impl IntoIterator<Item = u8>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }

    pub fn knows(&self, address: u8) -> bool {
        self.addresses.contains(&address)
    }

    pub fn encode(&self, frame: &Frame) -> Result<BytesMut> {
        frame.encode()
    }

    /// Decode a complete frame and check its address
    ///
    /// # Errors
    ///
    /// Everything [`Frame::decode`] rejects, plus `UnknownAddress` when the
    /// address is not configured.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame> {
        let frame = Frame::decode(buf)?;
        if !self.knows(frame.address) {
            return Err(Error::UnknownAddress(frame.address));
        }
        Ok(frame)
    }
}

/// Reassembles frames from arbitrary transport chunks
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract the next frame, if a complete one has arrived
    ///
    /// Bytes before SOM are discarded. A SOM followed by an impossible
    /// length is dropped so the next call resynchronizes on a later SOM.
    pub fn next_frame(&mut self, codec: &FrameCodec) -> Option<Result<Frame>> {
        match self.buf.iter().position(|b| *b == SOM) {
            Some(start) => self.buf.advance(start),
            None => {
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < 4 {
            return None;
        }

        let declared_len = LittleEndian::read_u16(&self.buf[2..4]) as usize;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&declared_len) {
            self.buf.advance(1);
            return Some(Err(Error::MalformedFrame(format!(
                "impossible frame length {}",
                declared_len
            ))));
        }

        if self.buf.len() < declared_len {
            return None;
        }

        let raw = self.buf.split_to(declared_len);
        Some(codec.decode(&raw))
    }
}
