//! Node and session key types.
//!
//! A node carries two identities:
//! - [`NodePublic`] — the stable, long-lived identity a peer is known by.
//! - [`SessionPublic`] / [`SessionPrivate`] — an ephemeral per-process
//!   keypair used for authenticated encryption between peers. It rotates
//!   whenever the client restarts.

use crate::error::CryptoError;
use crate::sealed::SharedKey;
use crate::KEY_SIZE;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Context string for deriving a transport key from the raw DH output
const SHARED_KEY_CONTEXT: &str = "trellis v1 session shared key";

/// Long-lived public identity of a peer (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePublic([u8; KEY_SIZE]);

impl NodePublic {
    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short human-readable rendering for logs.
    #[must_use]
    pub fn debug(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublic({}…)", self.debug())
    }
}

/// Ephemeral per-process public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionPublic([u8; KEY_SIZE]);

impl SessionPublic {
    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short human-readable rendering for logs.
    #[must_use]
    pub fn debug(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for SessionPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublic({}…)", self.debug())
    }
}

/// Ephemeral per-process private key.
///
/// Held privately by the keyring; everything downstream reaches it through
/// [`SessionKeyring::current`] so the key can rotate under the actors.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionPrivate(x25519_dalek::StaticSecret);

impl SessionPrivate {
    /// Generate a new random private key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Import from raw bytes (RFC 7748 clamping applies).
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the matching public key.
    #[must_use]
    pub fn public(&self) -> SessionPublic {
        SessionPublic(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Precompute the shared key for sealing to / opening from `peer`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::WeakPeerKey` if the peer key is a low-order
    /// point (the DH output would be all zeros).
    pub fn shared(&self, peer: &SessionPublic) -> Result<SharedKey, CryptoError> {
        let peer_key = x25519_dalek::PublicKey::from(peer.0);
        let secret = self.0.diffie_hellman(&peer_key);

        if secret.as_bytes() == &[0u8; KEY_SIZE] {
            return Err(CryptoError::WeakPeerKey);
        }

        Ok(SharedKey::new(blake3::derive_key(
            SHARED_KEY_CONTEXT,
            secret.as_bytes(),
        )))
    }
}

/// Hot-swappable holder of the current session private key.
///
/// Readers clone the key out; `rotate` installs a replacement without
/// disturbing in-flight users of the previous one.
pub struct SessionKeyring {
    current: RwLock<SessionPrivate>,
}

impl SessionKeyring {
    /// Create a keyring seeded with `key`.
    #[must_use]
    pub fn new(key: SessionPrivate) -> Self {
        Self {
            current: RwLock::new(key),
        }
    }

    /// The currently valid private key.
    #[must_use]
    pub fn current(&self) -> SessionPrivate {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The public half of the current key.
    #[must_use]
    pub fn public(&self) -> SessionPublic {
        self.current().public()
    }

    /// Replace the current key.
    pub fn rotate(&self, key: SessionPrivate) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = key;
    }
}
