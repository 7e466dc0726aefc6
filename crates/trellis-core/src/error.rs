//! Error types for the trellis core protocol.

use thiserror::Error;

/// Session-frame parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to carry magic and a sender key
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum parseable size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// The fixed magic prefix did not match
    #[error("frame magic mismatch")]
    BadMagic,
}

/// Message encode/decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Serialization failed
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization failed or the bytes are not a known message
    #[error("decode error: {0}")]
    Decode(String),
}
