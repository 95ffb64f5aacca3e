// src/protocol/error.rs
use thiserror::Error;

/// Typed decode failures for the binary codec.
///
/// Every variant means the whole packet is dropped; decode never leaves
/// partial state behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unsupported protocol version: expected {expected}, got {actual}")]
    BadVersion { expected: u8, actual: u8 },

    #[error("unknown packet type: {0:#04x}")]
    UnknownType(u8),

    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("bad length field in {field}: {value}")]
    BadLengthField { field: &'static str, value: usize },

    #[error("{field} exceeds limit: {actual} > {limit}")]
    FieldExceedsLimit {
        field: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("trailing garbage after packet: {remaining} bytes")]
    TrailingGarbage { remaining: usize },
}

pub type DecodeResult<T> = Result<T, DecodeError>;
