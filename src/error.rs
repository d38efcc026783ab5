//! Typed protocol errors.
//!
//! I/O, config loading, and process startup use `anyhow::Result`; the
//! decode paths that callers need to match on (RX-window filtering logs
//! differently than a truncated MAC payload) use this enum instead.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("PHY payload empty")]
    EmptyPayload,

    #[error("data frame too short: {0} bytes (minimum 12)")]
    FrameTooShort(usize),

    #[error("FOpts length {0} exceeds available data")]
    FOptsOverrun(u8),

    #[error("FOpts length {0} exceeds 15 bytes")]
    FOptsTooLong(u8),

    #[error("unsupported MType for this frame")]
    UnsupportedMType,

    #[error("DevAddr mismatch: frame={frame:08X} expected={expected:08X}")]
    DevAddrMismatch { frame: u32, expected: u32 },

    #[error("unknown MAC command CID 0x{0:02X}")]
    UnknownMacCid(u8),

    #[error("truncated MAC command payload for CID 0x{0:02X}")]
    TruncatedMacCommand(u8),

    #[error("GWMP packet too short: {0} bytes")]
    GwmpTooShort(usize),

    #[error("unsupported GWMP protocol version 0x{0:02X}")]
    UnsupportedGwmpVersion(u8),

    #[error("unknown GWMP identifier 0x{0:02X}")]
    UnknownGwmpIdentifier(u8),

    #[error("duplicate DevAddr {0} in configuration")]
    DuplicateDevAddr(String),
}
