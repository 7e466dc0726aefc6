//! Session-frame encoding and decoding.
//!
//! A session frame is the on-wire packet between two peers, carried either
//! over a relay or directly over UDP:
//!
//! ```text
//!   [ MAGIC (8 B ASCII) | SENDER SESSION KEY (32 B) | CIPHERTEXT (N B) ]
//! ```
//!
//! The codec only frames and unframes; it never decrypts. A frame whose
//! total length is exactly `MAGIC + 32` parses to an empty ciphertext,
//! which the crypto layer then rejects at open time.

use crate::error::FrameError;
use trellis_crypto::{SessionPublic, KEY_SIZE};

/// Fixed ASCII prefix identifying a trellis session frame.
pub const FRAME_MAGIC: &[u8; 8] = b"TRLSESS1";

/// Minimum parseable frame size: magic plus a sender key.
pub const MIN_FRAME_SIZE: usize = FRAME_MAGIC.len() + KEY_SIZE;

/// A parsed (still encrypted) session frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Ephemeral session key of the sender.
    pub sender: SessionPublic,
    /// Sealed payload bytes; opened by the cipher router.
    pub ciphertext: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Parse a session frame.
    ///
    /// # Errors
    ///
    /// - `FrameError::TooShort` if `bytes` cannot hold the magic and a
    ///   sender key.
    /// - `FrameError::BadMagic` if the prefix is not exactly [`FRAME_MAGIC`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FrameError::TooShort {
                expected: MIN_FRAME_SIZE,
                actual: bytes.len(),
            });
        }

        let (magic, rest) = bytes.split_at(FRAME_MAGIC.len());
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }

        let (key, ciphertext) = rest.split_at(KEY_SIZE);
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(key);

        Ok(Self {
            sender: SessionPublic::from_bytes(key_bytes),
            ciphertext,
        })
    }
}

/// Build the wire bytes for a session frame.
#[must_use]
pub fn build_frame(sender: &SessionPublic, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_SIZE + ciphertext.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Cheap ingress pre-filter: does `bytes` start with the session magic?
///
/// Dispatchers feeding the cipher router must filter with this; the router
/// treats a magic-less frame as an invariant violation.
#[must_use]
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= FRAME_MAGIC.len() && &bytes[..FRAME_MAGIC.len()] == FRAME_MAGIC
}
