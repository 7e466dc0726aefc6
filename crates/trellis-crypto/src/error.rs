//! Error types for trellis cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication failed when opening a sealed message.
    ///
    /// Covers tampering, truncation, and inputs sealed for a different key.
    #[error("authentication failed opening sealed message")]
    AuthFailure,

    /// The peer public key produced a degenerate shared secret
    #[error("peer public key is a low-order point")]
    WeakPeerKey,

    /// A key was constructed from a slice of the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key size in bytes
        expected: usize,
        /// Actual slice length
        actual: usize,
    },
}
