//! Control-plane message identities (client ↔ coordination server).
//!
//! Only the message identities and their semantic fields matter to the
//! session engine; the framing underneath the control connection is owned
//! by the transport layer.

use crate::error::ProtoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use trellis_crypto::{NodePublic, SessionPublic};

/// An IP prefix allocation (address plus prefix length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPrefix {
    /// Network address.
    pub addr: IpAddr,
    /// Prefix length in bits.
    pub len: u8,
}

impl IpPrefix {
    /// Construct a prefix.
    #[must_use]
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Self { addr, len }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// One relay in the server's relay catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Relay identifier, referenced by `HomeRelayUpdate`.
    pub id: i64,
    /// Addresses the relay listens on.
    pub addrs: Vec<SocketAddr>,
}

/// What a rejected client should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Retry immediately (transient server-side condition).
    Immediate,
    /// Retry with backoff.
    Backoff,
    /// Do not retry; the rejection is final.
    Never,
}

/// Control-plane messages.
///
/// Direction is noted per variant; the session engine treats receiving a
/// server-bound message from a server (or vice versa) as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// C→S: the device key the client wants to authenticate with.
    LogonDeviceKey {
        /// Opaque device key forwarded to business logic.
        device_key: String,
    },
    /// S→C: interactive authentication is required at this URL.
    LogonAuthenticate {
        /// URL the user must visit.
        authenticate_url: String,
    },
    /// S→C: logon accepted; the session is being finalized.
    LogonAccept {
        /// Assigned IPv4 prefix.
        ipv4: IpPrefix,
        /// Assigned IPv6 prefix.
        ipv6: IpPrefix,
        /// Opaque session identifier for business-logic calls.
        session_id: [u8; 32],
    },
    /// S→C: logon rejected.
    LogonReject {
        /// Human-readable reason.
        reason: String,
        /// Whether and how to retry.
        retry_strategy: RetryStrategy,
    },
    /// S→C: the current relay catalogue.
    RelayUpdate {
        /// All relays the client may use.
        relays: Vec<RelayInfo>,
    },
    /// S→C: a peer became visible; full fact set (upsert on the client).
    PeerAddition {
        /// Peer's long-lived identity.
        pub_key: NodePublic,
        /// Peer's current session key.
        sess_key: SessionPublic,
        /// Peer's IPv4 address inside the overlay.
        ipv4: IpAddr,
        /// Peer's IPv6 address inside the overlay.
        ipv6: IpAddr,
        /// Peer's current reachable endpoints.
        endpoints: Vec<SocketAddr>,
        /// Peer's home relay id.
        home_relay: i64,
    },
    /// S→C: some peer facts changed; only the present fields did.
    PeerUpdate {
        /// Peer's long-lived identity.
        pub_key: NodePublic,
        /// New session key, if it rotated.
        sess_key: Option<SessionPublic>,
        /// New endpoints, if they changed.
        endpoints: Option<Vec<SocketAddr>>,
        /// New home relay, if it changed.
        home_relay: Option<i64>,
    },
    /// S→C: a peer is no longer visible.
    PeerRemove {
        /// Peer's long-lived identity.
        pub_key: NodePublic,
    },
    /// C→S: the client's current reachable endpoints.
    EndpointUpdate {
        /// Endpoint list; `None` is invalid and warned about server-side.
        endpoints: Option<Vec<SocketAddr>>,
    },
    /// C→S: the client's chosen home relay.
    HomeRelayUpdate {
        /// Relay id from the catalogue.
        home_relay: i64,
    },
    /// S→C: liveness probe.
    Ping {
        /// Probe identifier echoed by the pong.
        tx_id: u64,
    },
    /// C→S: response to a [`ControlMessage::Ping`].
    Pong {
        /// Identifier of the probe being answered.
        tx_id: u64,
    },
}

impl ControlMessage {
    /// Message kind name for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::LogonDeviceKey { .. } => "LogonDeviceKey",
            ControlMessage::LogonAuthenticate { .. } => "LogonAuthenticate",
            ControlMessage::LogonAccept { .. } => "LogonAccept",
            ControlMessage::LogonReject { .. } => "LogonReject",
            ControlMessage::RelayUpdate { .. } => "RelayUpdate",
            ControlMessage::PeerAddition { .. } => "PeerAddition",
            ControlMessage::PeerUpdate { .. } => "PeerUpdate",
            ControlMessage::PeerRemove { .. } => "PeerRemove",
            ControlMessage::EndpointUpdate { .. } => "EndpointUpdate",
            ControlMessage::HomeRelayUpdate { .. } => "HomeRelayUpdate",
            ControlMessage::Ping { .. } => "Ping",
            ControlMessage::Pong { .. } => "Pong",
        }
    }

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
    /// Returns `ProtoError::Decode` if the bytes are not a control message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        bincode::deserialize(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
    }
}
