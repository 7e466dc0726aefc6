//! Authenticated sealing between two parties sharing a precomputed key.
//!
//! The sealed layout is `nonce (24 B) || ciphertext || tag (16 B)`. The
//! extended XChaCha20 nonce is drawn fresh from the OS CSPRNG per message,
//! which keeps random generation collision-safe within a shared key.

use crate::error::CryptoError;
use crate::{KEY_SIZE, MIN_SEALED_SIZE, NONCE_SIZE};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Precomputed symmetric key between a local session private key and one
/// peer session public key.
///
/// Sealing is authenticated: [`SharedKey::open`] fails with
/// [`CryptoError::AuthFailure`] on any modification of the sealed bytes,
/// truncation included.
#[derive(Clone, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    /// Wrap derived key material.
    #[must_use]
    pub(crate) fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Seal `plaintext`, producing `nonce || ciphertext || tag`.
    #[must_use]
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        // Encryption with a fresh random nonce cannot fail.
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .expect("XChaCha20-Poly1305 encryption is infallible");

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        sealed
    }

    /// Open a sealed message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthFailure` if `sealed` is shorter than a
    /// nonce plus a tag, or if authentication fails for any reason.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < MIN_SEALED_SIZE {
            return Err(CryptoError::AuthFailure);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthFailure)
    }
}
