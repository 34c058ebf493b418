//! High-level error types

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Core protocol error: {0}")]
    Core(#[from] osdp_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] osdp_transport::Error),

    #[error("Type error: {0}")]
    Types(#[from] osdp_types::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No peripheral configured at address 0x{0:02X}")]
    UnknownAddress(u8),

    #[error("File transfer already in progress for 0x{0:02X}")]
    TransferInProgress(u8),

    #[error("Bus has shut down")]
    Shutdown,
}
