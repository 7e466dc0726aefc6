//! Error types for the cipher router.

use thiserror::Error;
use trellis_core::{FrameError, ProtoError};
use trellis_crypto::CryptoError;

/// Errors raised while unpacking or packing session frames.
///
/// All of these are data-plane failures: the router logs them with frame
/// metadata and drops the message, it never tears down over them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The frame did not parse (too short; magic is checked upstream).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Decryption or key agreement failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The decrypted bytes were not a session payload.
    #[error("payload error: {0}")]
    Payload(#[from] ProtoError),
}
