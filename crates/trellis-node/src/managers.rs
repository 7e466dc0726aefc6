//! Mailbox contracts for the router's external collaborators.
//!
//! The traffic manager consumes decrypted session messages; the relay and
//! direct managers consume framed bytes for egress. All mailboxes are
//! bounded: a full mailbox blocks the sender, and that backpressure is the
//! intended flow-control signal.

use std::net::SocketAddr;
use tokio::sync::mpsc;
use trellis_core::ClearMessage;
use trellis_crypto::NodePublic;

/// Decrypted session messages delivered to the traffic manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficMessage {
    /// A session message that arrived through a relay.
    FromRelay {
        /// Relay the frame came through.
        relay_id: i64,
        /// Peer the relay attributed the frame to.
        peer: NodePublic,
        /// The decrypted message.
        clear: ClearMessage,
    },
    /// A session message that arrived directly over UDP.
    FromDirect {
        /// Source address of the datagram.
        addr_port: SocketAddr,
        /// The decrypted message.
        clear: ClearMessage,
    },
}

/// Sending half of the traffic manager's mailbox.
#[derive(Clone)]
pub struct TrafficHandle {
    tx: mpsc::Sender<TrafficMessage>,
}

impl TrafficHandle {
    /// Create a bounded mailbox, returning the handle and receiving half.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TrafficMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Deliver a decrypted message, awaiting mailbox capacity.
    ///
    /// Returns `false` if the traffic manager is gone.
    pub async fn deliver(&self, msg: TrafficMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

/// A framed packet bound for a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDatagram {
    /// Complete session frame bytes.
    pub frame: Vec<u8>,
    /// Relay to send through.
    pub relay_id: i64,
    /// Destination peer on that relay.
    pub peer: NodePublic,
}

/// Sending half of the relay manager's mailbox.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayDatagram>,
}

impl RelayHandle {
    /// Create a bounded mailbox, returning the handle and receiving half.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayDatagram>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Hand framed bytes to the relay manager for egress.
    ///
    /// Returns `false` if the relay manager is gone.
    pub async fn write_to(&self, frame: Vec<u8>, relay_id: i64, peer: NodePublic) -> bool {
        self.tx
            .send(RelayDatagram {
                frame,
                relay_id,
                peer,
            })
            .await
            .is_ok()
    }
}

/// A framed packet bound for a direct UDP path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectDatagram {
    /// Complete session frame bytes.
    pub frame: Vec<u8>,
    /// Destination address.
    pub addr_port: SocketAddr,
}

/// Sending half of the direct manager's mailbox.
#[derive(Clone)]
pub struct DirectHandle {
    tx: mpsc::Sender<DirectDatagram>,
}

impl DirectHandle {
    /// Create a bounded mailbox, returning the handle and receiving half.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DirectDatagram>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Hand framed bytes to the direct manager for egress.
    ///
    /// Returns `false` if the direct manager is gone.
    pub async fn write_to(&self, frame: Vec<u8>, addr_port: SocketAddr) -> bool {
        self.tx
            .send(DirectDatagram { frame, addr_port })
            .await
            .is_ok()
    }
}
