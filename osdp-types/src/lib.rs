//! Type definitions for osdp
//!
//! Plain data types shared between the protocol core and the bus:
//! typed command fields, typed reply payloads and bus events.

pub mod command;
pub mod error;
pub mod event;
pub mod reply;

pub use command::{
    BuzzerControl, ComSettings, CommandFields, FileFragment, KeySet, LedColor, LedControl,
    LedPermanent, LedTemporary, ManufacturerData, OutputControl, TextOutput,
};
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use reply::{
    Capability, CardRead, ClientCryptogram, FileTransferStatus, FormattedCard, KeypadData,
    LocalStatus, NakReason, PdId, Reply,
};
