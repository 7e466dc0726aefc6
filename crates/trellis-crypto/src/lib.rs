//! # Trellis Crypto
//!
//! Cryptographic primitives for the trellis overlay network.
//!
//! This crate provides:
//! - Long-lived node identities and ephemeral session keypairs (X25519)
//! - Precomputed shared keys with authenticated sealing
//!   (`XChaCha20-Poly1305` over a BLAKE3-derived key)
//! - A hot-swappable keyring so the session key can rotate without
//!   rewiring the actors that encrypt with it
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | KDF | BLAKE3 `derive_key` |
//! | AEAD | XChaCha20-Poly1305 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod key;
pub mod random;
pub mod sealed;

pub use error::CryptoError;
pub use key::{NodePublic, SessionKeyring, SessionPrivate, SessionPublic};
pub use random::random_id;
pub use sealed::SharedKey;

/// Public key size (both node and session keys)
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Smallest output `SharedKey::seal` can produce (empty plaintext)
pub const MIN_SEALED_SIZE: usize = NONCE_SIZE + TAG_SIZE;
