//! Command/reply registry
//!
//! Encodes typed command fields into command data, decodes reply data
//! into typed replies, and holds the table of replies each command may
//! legally receive.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use osdp_types::{
    Capability, CardRead, ClientCryptogram, ComSettings, CommandFields, FileTransferStatus,
    FormattedCard, KeypadData, LocalStatus, ManufacturerData, NakReason, PdId, Reply,
};

use crate::{
    command::{CommandCode, ReplyCode},
    error::{Error, Result},
};

/// Size of one output control record
const OUTPUT_RECORD_SIZE: usize = 4;

/// Size of one LED control record
const LED_RECORD_SIZE: usize = 14;

/// Request byte sent with ID and CAP ("standard report")
const STANDARD_REPORT: u8 = 0x00;

/// Replies POLL may be answered with: anything except handshake messages
const POLL_REPLIES: &[ReplyCode] = &[
    ReplyCode::Ack,
    ReplyCode::Nak,
    ReplyCode::PdId,
    ReplyCode::PdCap,
    ReplyCode::LocalStatus,
    ReplyCode::InputStatus,
    ReplyCode::OutputStatus,
    ReplyCode::ReaderStatus,
    ReplyCode::Raw,
    ReplyCode::Formatted,
    ReplyCode::Keypad,
    ReplyCode::Com,
    ReplyCode::Busy,
    ReplyCode::FileTransferStatus,
    ReplyCode::Manufacturer,
];

/// Replies a command may legally receive (BUSY excluded, it is always allowed)
pub fn acceptable_replies(command: CommandCode) -> &'static [ReplyCode] {
    use ReplyCode::*;

    match command {
        CommandCode::Poll => POLL_REPLIES,
        CommandCode::Id => &[PdId, Nak],
        CommandCode::Cap => &[PdCap, Nak],
        CommandCode::LocalStatus => &[LocalStatus, Nak],
        CommandCode::InputStatus => &[InputStatus, Nak],
        CommandCode::OutputStatus => &[OutputStatus, Nak],
        CommandCode::ReaderStatus => &[ReaderStatus, Nak],
        CommandCode::Output => &[Ack, OutputStatus, Nak],
        CommandCode::Led
        | CommandCode::Buzzer
        | CommandCode::Text
        | CommandCode::KeySet
        | CommandCode::AcuRxSize
        | CommandCode::KeepActive => &[Ack, Nak],
        CommandCode::ComSet => &[Com, Nak],
        CommandCode::Challenge => &[ClientCryptogram, Nak],
        CommandCode::ServerCryptogram => &[InitialRmac, Nak],
        CommandCode::FileTransfer => &[FileTransferStatus, Nak],
        CommandCode::Manufacturer => &[Ack, Manufacturer, Nak],
    }
}

/// Check a reply code against the command it answers
///
/// # Errors
///
/// Returns `UnknownReplyCode` for codes outside the catalog and
/// `UnexpectedReply` for codes the command does not accept.
pub fn check_reply(command: CommandCode, reply: u8) -> Result<ReplyCode> {
    let code = ReplyCode::try_from(reply)?;

    if code == ReplyCode::Busy || acceptable_replies(command).contains(&code) {
        Ok(code)
    } else {
        Err(Error::UnexpectedReply {
            command: command.into(),
            reply,
        })
    }
}

fn schema_mismatch(code: CommandCode, reason: impl Into<String>) -> Error {
    Error::SchemaMismatch {
        code: code.into(),
        reason: reason.into(),
    }
}

/// Encode the data bytes of a command
///
/// # Errors
///
/// Returns `SchemaMismatch` if `fields` is not the schema of `code` or a
/// field value cannot be represented on the wire.
///
/// # Examples
///
/// ```
/// use osdp_core::command::CommandCode;
/// use osdp_core::registry::encode_command;
/// use osdp_types::CommandFields;
///
/// let data = encode_command(CommandCode::Id, &CommandFields::Empty).unwrap();
/// assert_eq!(data.as_ref(), &[0x00]);
///
/// assert!(encode_command(CommandCode::Led, &CommandFields::Empty).is_err());
/// ```
pub fn encode_command(code: CommandCode, fields: &CommandFields) -> Result<Bytes> {
    let mut buf = BytesMut::new();

    match (code, fields) {
        (CommandCode::Poll, CommandFields::Empty)
        | (CommandCode::LocalStatus, CommandFields::Empty)
        | (CommandCode::InputStatus, CommandFields::Empty)
        | (CommandCode::OutputStatus, CommandFields::Empty)
        | (CommandCode::ReaderStatus, CommandFields::Empty) => {}

        (CommandCode::Id, CommandFields::Empty) | (CommandCode::Cap, CommandFields::Empty) => {
            buf.put_u8(STANDARD_REPORT);
        }

        (CommandCode::Output, CommandFields::Output(records)) => {
            if records.is_empty() {
                return Err(schema_mismatch(code, "at least one output record required"));
            }
            buf.reserve(records.len() * OUTPUT_RECORD_SIZE);
            for record in records {
                buf.put_u8(record.output);
                buf.put_u8(record.control_code);
                buf.put_u16_le(record.timer);
            }
        }

        (CommandCode::Led, CommandFields::Led(records)) => {
            if records.is_empty() {
                return Err(schema_mismatch(code, "at least one LED record required"));
            }
            buf.reserve(records.len() * LED_RECORD_SIZE);
            for record in records {
                let temp = &record.temporary;
                let perm = &record.permanent;

                buf.put_u8(record.reader);
                buf.put_u8(record.led);
                buf.put_u8(temp.control_code);
                buf.put_u8(temp.on_time);
                buf.put_u8(temp.off_time);
                buf.put_u8(temp.on_color as u8);
                buf.put_u8(temp.off_color as u8);
                buf.put_u16_le(temp.timer);
                buf.put_u8(perm.control_code);
                buf.put_u8(perm.on_time);
                buf.put_u8(perm.off_time);
                buf.put_u8(perm.on_color as u8);
                buf.put_u8(perm.off_color as u8);
            }
        }

        (CommandCode::Buzzer, CommandFields::Buzzer(buzzer)) => {
            buf.put_slice(&[
                buzzer.reader,
                buzzer.tone,
                buzzer.on_time,
                buzzer.off_time,
                buzzer.count,
            ]);
        }

        (CommandCode::Text, CommandFields::Text(text)) => {
            buf.put_slice(&[
                text.reader,
                text.command,
                text.temp_time,
                text.row,
                text.column,
                text.text().len() as u8,
            ]);
            buf.put_slice(text.text().as_bytes());
        }

        (CommandCode::ComSet, CommandFields::ComSet(settings)) => {
            buf.put_u8(settings.address);
            buf.put_u32_le(settings.baud_rate);
        }

        (CommandCode::KeySet, CommandFields::KeySet(keyset)) => {
            buf.put_u8(keyset.key_type);
            buf.put_u8(keyset.key().len() as u8);
            buf.put_slice(keyset.key());
        }

        (CommandCode::Challenge, CommandFields::Challenge(rnd_a)) => {
            buf.put_slice(rnd_a);
        }

        (CommandCode::ServerCryptogram, CommandFields::ServerCryptogram(cryptogram)) => {
            buf.put_slice(cryptogram);
        }

        (CommandCode::AcuRxSize, CommandFields::AcuRxSize(size)) => {
            buf.put_u16_le(*size);
        }

        (CommandCode::KeepActive, CommandFields::KeepActive(millis)) => {
            buf.put_u16_le(*millis);
        }

        (CommandCode::FileTransfer, CommandFields::FileTransfer(fragment)) => {
            let len = u16::try_from(fragment.data.len())
                .map_err(|_| schema_mismatch(code, "fragment longer than 65535 bytes"))?;
            buf.put_u8(fragment.file_type);
            buf.put_u32_le(fragment.total_size);
            buf.put_u32_le(fragment.offset);
            buf.put_u16_le(len);
            buf.put_slice(&fragment.data);
        }

        (CommandCode::Manufacturer, CommandFields::Manufacturer(mfg)) => {
            buf.put_slice(&mfg.vendor);
            buf.put_slice(&mfg.data);
        }

        (code, fields) => {
            return Err(schema_mismatch(
                code,
                format!("{} does not take {} fields", code.name(), fields.schema_name()),
            ));
        }
    }

    trace!(code = %code, len = buf.len(), "Encoded command data");

    Ok(buf.freeze())
}

fn require(code: ReplyCode, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::TruncatedPayload {
            code: code.into(),
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn array<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}

/// Decode reply data into a typed reply
///
/// # Errors
///
/// Returns `UnknownReplyCode` for codes outside the catalog and
/// `TruncatedPayload` when `data` is shorter than the reply requires.
///
/// # Examples
///
/// ```
/// use osdp_core::registry::decode_reply;
/// use osdp_types::{LocalStatus, Reply};
///
/// let reply = decode_reply(0x48, &[0x01, 0x00]).unwrap();
/// assert_eq!(reply, Reply::LocalStatus(LocalStatus { tamper: true, power_failure: false }));
///
/// assert!(decode_reply(0x48, &[0x01]).is_err());
/// assert!(decode_reply(0x01, &[]).is_err());
/// ```
pub fn decode_reply(code: u8, data: &[u8]) -> Result<Reply> {
    let code = ReplyCode::try_from(code)?;

    let reply = match code {
        ReplyCode::Ack => Reply::Ack,
        ReplyCode::Busy => Reply::Busy,

        ReplyCode::Nak => {
            require(code, data, 1)?;
            Reply::Nak(NakReason::from(data[0]))
        }

        ReplyCode::PdId => {
            require(code, data, 12)?;
            Reply::PdId(PdId {
                vendor_code: array(&data[0..3]),
                model: data[3],
                version: data[4],
                serial_number: LittleEndian::read_u32(&data[5..9]),
                firmware: (data[9], data[10], data[11]),
            })
        }

        ReplyCode::PdCap => Reply::Capabilities(
            data.chunks_exact(3)
                .map(|record| Capability {
                    function: record[0],
                    compliance: record[1],
                    count: record[2],
                })
                .collect(),
        ),

        ReplyCode::LocalStatus => {
            require(code, data, 2)?;
            Reply::LocalStatus(LocalStatus {
                tamper: data[0] != 0,
                power_failure: data[1] != 0,
            })
        }

        ReplyCode::InputStatus => Reply::InputStatus(data.iter().map(|b| *b != 0).collect()),
        ReplyCode::OutputStatus => Reply::OutputStatus(data.iter().map(|b| *b != 0).collect()),
        ReplyCode::ReaderStatus => Reply::ReaderStatus(data.to_vec()),

        ReplyCode::Raw => {
            require(code, data, 4)?;
            let bit_count = LittleEndian::read_u16(&data[2..4]);
            let byte_count = (bit_count as usize).div_ceil(8);
            require(code, data, 4 + byte_count)?;
            Reply::RawCard(CardRead {
                reader: data[0],
                format: data[1],
                bit_count,
                data: Bytes::copy_from_slice(&data[4..4 + byte_count]),
            })
        }

        ReplyCode::Formatted => {
            require(code, data, 3)?;
            let len = data[2] as usize;
            require(code, data, 3 + len)?;
            Reply::FormattedCard(FormattedCard {
                reader: data[0],
                direction: data[1],
                data: String::from_utf8_lossy(&data[3..3 + len]).into_owned(),
            })
        }

        ReplyCode::Keypad => {
            require(code, data, 2)?;
            let count = data[1] as usize;
            require(code, data, 2 + count)?;
            Reply::Keypad(KeypadData {
                reader: data[0],
                digits: Bytes::copy_from_slice(&data[2..2 + count]),
            })
        }

        ReplyCode::Com => {
            require(code, data, 5)?;
            Reply::Com(ComSettings {
                address: data[0],
                baud_rate: LittleEndian::read_u32(&data[1..5]),
            })
        }

        ReplyCode::Manufacturer => {
            require(code, data, 3)?;
            Reply::Manufacturer(ManufacturerData {
                vendor: array(&data[0..3]),
                data: Bytes::copy_from_slice(&data[3..]),
            })
        }

        ReplyCode::FileTransferStatus => {
            require(code, data, 7)?;
            Reply::FileTransferStatus(FileTransferStatus {
                action: data[0],
                delay_ms: LittleEndian::read_u16(&data[1..3]),
                status: LittleEndian::read_i16(&data[3..5]),
                update_msg_max: LittleEndian::read_u16(&data[5..7]),
            })
        }

        ReplyCode::ClientCryptogram => {
            require(code, data, 32)?;
            Reply::ClientCryptogram(ClientCryptogram {
                client_uid: array(&data[0..8]),
                rnd_b: array(&data[8..16]),
                cryptogram: array(&data[16..32]),
            })
        }

        ReplyCode::InitialRmac => {
            require(code, data, 16)?;
            Reply::InitialRmac(array(&data[0..16]))
        }
    };

    trace!(code = %code, "Decoded {}", reply);

    Ok(reply)
}

/// Check a reply against its command, then decode it
pub fn decode_reply_for(command: CommandCode, reply: u8, data: &[u8]) -> Result<Reply> {
    check_reply(command, reply)?;
    decode_reply(reply, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdp_types::{
        BuzzerControl, FileFragment, KeySet, LedColor, LedControl, OutputControl, TextOutput,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_commands() {
        for code in [
            CommandCode::Poll,
            CommandCode::LocalStatus,
            CommandCode::InputStatus,
            CommandCode::OutputStatus,
            CommandCode::ReaderStatus,
        ] {
            assert!(encode_command(code, &CommandFields::Empty).unwrap().is_empty());
        }
        assert_eq!(
            encode_command(CommandCode::Cap, &CommandFields::Empty).unwrap().as_ref(),
            &[0x00]
        );
    }

    #[test]
    fn test_schema_mismatch() {
        let result = encode_command(CommandCode::Poll, &CommandFields::KeepActive(100));
        assert!(matches!(result, Err(Error::SchemaMismatch { code: 0x60, .. })));

        let result = encode_command(CommandCode::Output, &CommandFields::Output(vec![]));
        assert!(matches!(result, Err(Error::SchemaMismatch { code: 0x68, .. })));
    }

    #[test]
    fn test_encode_output() {
        let fields = CommandFields::Output(vec![OutputControl {
            output: 1,
            control_code: 5,
            timer: 0x0102,
        }]);
        let data = encode_command(CommandCode::Output, &fields).unwrap();
        assert_eq!(data.as_ref(), &[0x01, 0x05, 0x02, 0x01]);
    }

    #[test]
    fn test_encode_led() {
        let fields = CommandFields::Led(vec![LedControl::steady(0, 1, LedColor::Green)]);
        let data = encode_command(CommandCode::Led, &fields).unwrap();

        assert_eq!(data.len(), LED_RECORD_SIZE);
        assert_eq!(&data[..2], &[0x00, 0x01]);
        assert_eq!(&data[9..], &[0x01, 0x01, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_encode_buzzer_and_text() {
        let buzzer = BuzzerControl {
            reader: 0,
            tone: 2,
            on_time: 5,
            off_time: 5,
            count: 3,
        };
        let data = encode_command(CommandCode::Buzzer, &CommandFields::Buzzer(buzzer)).unwrap();
        assert_eq!(data.as_ref(), &[0, 2, 5, 5, 3]);

        let text = TextOutput::new(0, 1, 1, 1, "Hi").unwrap();
        let data = encode_command(CommandCode::Text, &CommandFields::Text(text)).unwrap();
        assert_eq!(data.as_ref(), &[0, 1, 0, 1, 1, 2, b'H', b'i']);
    }

    #[test]
    fn test_encode_keyset() {
        let fields = CommandFields::KeySet(KeySet::scbk([0x11; 16]));
        let data = encode_command(CommandCode::KeySet, &fields).unwrap();

        assert_eq!(data.len(), 18);
        assert_eq!(&data[..2], &[0x01, 0x10]);
    }

    #[test]
    fn test_encode_file_transfer() {
        let fields = CommandFields::FileTransfer(FileFragment {
            file_type: 1,
            total_size: 1000,
            offset: 128,
            data: Bytes::from_static(&[0xAB; 4]),
        });
        let data = encode_command(CommandCode::FileTransfer, &fields).unwrap();

        assert_eq!(
            data.as_ref(),
            &[1, 0xE8, 0x03, 0, 0, 0x80, 0, 0, 0, 4, 0, 0xAB, 0xAB, 0xAB, 0xAB]
        );
    }

    #[test]
    fn test_decode_pd_id() {
        let data = [0x5C, 0x26, 0x23, 1, 2, 0xEF, 0xBE, 0xAD, 0xDE, 1, 4, 7];
        let reply = decode_reply(0x45, &data).unwrap();

        assert_eq!(
            reply,
            Reply::PdId(PdId {
                vendor_code: [0x5C, 0x26, 0x23],
                model: 1,
                version: 2,
                serial_number: 0xDEADBEEF,
                firmware: (1, 4, 7),
            })
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode_reply(0x45, &[0u8; 11]),
            Err(Error::TruncatedPayload { code: 0x45, expected: 12, actual: 11 })
        ));
        assert!(matches!(
            decode_reply(0x50, &[0, 1, 26, 0, 0xFF]),
            Err(Error::TruncatedPayload { code: 0x50, .. })
        ));
    }

    #[test]
    fn test_decode_unknown_code() {
        assert!(matches!(decode_reply(0x42, &[]), Err(Error::UnknownReplyCode(0x42))));
    }

    #[test]
    fn test_decode_raw_card() {
        let reply = decode_reply(0x50, &[0, 1, 26, 0, 0x12, 0x34, 0x56, 0xC0]).unwrap();
        match reply {
            Reply::RawCard(card) => {
                assert_eq!(card.bit_count, 26);
                assert_eq!(card.data.as_ref(), &[0x12, 0x34, 0x56, 0xC0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_file_transfer_status() {
        let reply = decode_reply(0x7A, &[0x01, 0x64, 0x00, 0xFD, 0xFF, 0x00, 0x02]).unwrap();
        assert_eq!(
            reply,
            Reply::FileTransferStatus(FileTransferStatus {
                action: 1,
                delay_ms: 100,
                status: -3,
                update_msg_max: 512,
            })
        );
    }

    #[test]
    fn test_decode_capabilities_ignores_partial_record() {
        let reply = decode_reply(0x46, &[9, 1, 1, 10, 0x00, 0x04, 0xFF]).unwrap();
        assert_eq!(
            reply,
            Reply::Capabilities(vec![
                Capability { function: 9, compliance: 1, count: 1 },
                Capability { function: 10, compliance: 0, count: 4 },
            ])
        );
    }

    #[test]
    fn test_acceptable_replies() {
        assert!(check_reply(CommandCode::Id, 0x45).is_ok());
        assert!(check_reply(CommandCode::Id, 0x79).is_ok());
        assert!(matches!(
            check_reply(CommandCode::Id, 0x40),
            Err(Error::UnexpectedReply { command: 0x61, reply: 0x40 })
        ));
        assert!(check_reply(CommandCode::Poll, 0x45).is_ok());
        assert!(check_reply(CommandCode::Poll, 0x76).is_err());
        assert!(check_reply(CommandCode::Challenge, 0x76).is_ok());
    }

    #[test]
    fn test_decode_reply_for() {
        assert!(matches!(
            decode_reply_for(CommandCode::Led, 0x48, &[0, 0]),
            Err(Error::UnexpectedReply { .. })
        ));
        assert_eq!(decode_reply_for(CommandCode::Led, 0x40, &[]).unwrap(), Reply::Ack);
    }
}
