//! Business-logic callbacks, the visibility oracle, and pair operations.

use std::collections::HashMap;
use std::fmt;
use trellis_core::{IpPrefix, RetryStrategy};
use trellis_crypto::{random_id, NodePublic};

/// Opaque 32-byte session identifier handed to business logic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 32]);

impl SessionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(random_id())
    }

    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short human-readable rendering for logs.
    #[must_use]
    pub fn debug(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}…)", self.debug())
    }
}

/// Authorization fact stating that two clients may observe each other.
///
/// Produced by the [`VisibilityOracle`]; carried through pair operations to
/// the external broadcaster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisibilityPair {
    /// Free-form grouping label from the oracle (policy or network name).
    pub label: Option<String>,
}

/// A newly paired, mutually established pair of sessions.
#[derive(Clone, Debug)]
pub struct PairOperation {
    /// Session id of the side that formed the pair.
    pub a: SessionId,
    /// Session id of the other side.
    pub b: SessionId,
    /// Node identity behind `a`.
    pub a_node: NodePublic,
    /// Node identity behind `b`.
    pub b_node: NodePublic,
    /// The authorization fact that created the pair.
    pub pair: VisibilityPair,
}

/// Pluggable source of the visibility relation.
///
/// Must be symmetric: `visible_to(a)` contains `b` iff `visible_to(b)`
/// contains `a`.
pub trait VisibilityOracle: Send + Sync {
    /// Which nodes may `peer` observe, and under which pair facts.
    fn visible_to(&self, peer: &NodePublic) -> HashMap<NodePublic, VisibilityPair>;
}

/// Business-logic callback surface.
///
/// Invoked inline by session tasks; implementations should hand work off
/// quickly and answer through the auth-directive mailbox.
pub trait SessionHooks: Send + Sync {
    /// A session entered the authenticate phase on a fresh connection.
    fn on_session_create(&self, sess: SessionId, client: NodePublic);

    /// A retained session was resumed by a reconnect.
    fn on_session_resume(&self, sess: SessionId, client: NodePublic);

    /// The client presented its device key.
    fn on_device_key(&self, sess: SessionId, device_key: &str);

    /// Authentication succeeded; allocate the client's address prefixes.
    fn on_session_finalize(&self, sess: SessionId, client: NodePublic) -> (IpPrefix, IpPrefix);
}

/// Directives business logic feeds back into a session's auth mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDirective {
    /// Accept the logon; the session proceeds to Greet.
    Accept,
    /// Reject the logon; the session writes the rejection and terminates.
    Reject {
        /// Human-readable reason.
        reason: String,
        /// Whether and how the client should retry.
        retry_strategy: RetryStrategy,
    },
    /// Ask the client to authenticate interactively at `url`.
    ///
    /// Sending this twice for one session is a directive violation.
    AuthUrl {
        /// URL the user must visit.
        url: String,
    },
}
