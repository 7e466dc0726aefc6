//! Peer-to-peer session payloads.
//!
//! These are the messages two peers exchange *inside* sealed session
//! frames: path probes and rendezvous hints used by the traffic manager to
//! upgrade from relayed to direct connectivity.

use crate::error::ProtoError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use trellis_crypto::SessionPublic;

/// Decrypted session message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// Path liveness probe.
    Ping {
        /// Probe identifier echoed by the matching pong.
        tx_id: u64,
    },
    /// Response to a [`SessionPayload::Ping`].
    Pong {
        /// Identifier of the probe being answered.
        tx_id: u64,
    },
    /// Rendezvous hint: the sender can be reached on these endpoints.
    CallMeMaybe {
        /// Candidate endpoints, best first.
        endpoints: Vec<SocketAddr>,
    },
}

impl SessionPayload {
    /// Encode to bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        bincode::serialize(self).map_err(|e| ProtoError::Encode(e.to_string()))
    }

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::Decode` if the bytes are not a session payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        bincode::deserialize(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
    }
}

/// A decrypted session message together with the sender it authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearMessage {
    /// Session key the frame was sealed with; authenticated by decryption.
    pub session: SessionPublic,
    /// The decoded payload.
    pub payload: SessionPayload,
}
