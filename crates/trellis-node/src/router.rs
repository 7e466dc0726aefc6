//! The cipher router actor.
//!
//! Receives encrypted session frames from the relay and direct ingress
//! paths, opens them with the current session key, and forwards the
//! decoded messages to the traffic manager. In the other direction it
//! seals outbound payloads and hands the framed bytes to the relay or
//! direct manager.
//!
//! Decryption failures are logged with frame metadata and dropped; they
//! never tear the actor down. A frame that reaches the router without the
//! session magic is an ingress invariant violation and panics — the
//! supervisor records it and cancels only this actor.

use crate::error::RouterError;
use crate::managers::{DirectHandle, RelayHandle, TrafficHandle, TrafficMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis_core::{
    build_frame, has_magic, spawn_supervised, CancelToken, ClearMessage, Frame, SessionPayload,
    MAILBOX_CAPACITY,
};
use trellis_crypto::{NodePublic, SessionKeyring, SessionPublic};

/// Messages accepted on the router's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterMessage {
    /// An encrypted frame that arrived through a relay.
    FrameFromRelay {
        /// Relay the frame came through.
        relay_id: i64,
        /// Peer the relay attributed the frame to.
        peer: NodePublic,
        /// Frame bytes, magic included.
        frame: Vec<u8>,
    },
    /// An encrypted frame that arrived directly over UDP.
    FrameFromAddrPort {
        /// Source address of the datagram.
        addr_port: SocketAddr,
        /// Frame bytes, magic included.
        frame: Vec<u8>,
    },
    /// Seal and send a payload through a relay.
    SendToRelay {
        /// Payload to seal.
        payload: SessionPayload,
        /// Recipient's session key.
        to_session: SessionPublic,
        /// Relay to send through.
        relay_id: i64,
        /// Destination peer on that relay.
        peer: NodePublic,
    },
    /// Seal and send a payload directly over UDP.
    SendToDirect {
        /// Payload to seal.
        payload: SessionPayload,
        /// Recipient's session key.
        to_session: SessionPublic,
        /// Destination address.
        addr_port: SocketAddr,
    },
}

/// Sending half of the router's mailbox.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterMessage>,
}

impl RouterHandle {
    /// Enqueue a message, awaiting mailbox capacity.
    ///
    /// Returns `false` if the router has exited.
    pub async fn send(&self, msg: RouterMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

/// The cipher router actor. Single consumer of its mailbox.
pub struct CipherRouter {
    inbox: mpsc::Receiver<RouterMessage>,
    keyring: Arc<SessionKeyring>,
    traffic: TrafficHandle,
    relay: RelayHandle,
    direct: DirectHandle,
    cancel: CancelToken,
}

impl CipherRouter {
    /// Create a router and the handle used to feed it.
    #[must_use]
    pub fn new(
        keyring: Arc<SessionKeyring>,
        traffic: TrafficHandle,
        relay: RelayHandle,
        direct: DirectHandle,
        cancel: CancelToken,
    ) -> (RouterHandle, Self) {
        let (tx, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        tracing::debug!(sess = %keyring.public().debug(), "cipher router created");
        (
            RouterHandle { tx },
            Self {
                inbox,
                keyring,
                traffic,
                relay,
                direct,
                cancel,
            },
        )
    }

    /// Spawn the router under a panic supervisor.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        spawn_supervised("cipher-router", cancel, self.run())
    }

    /// Run the mailbox loop until cancellation or all senders drop.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("cipher router cancelled");
                    return;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        tracing::debug!("cipher router inbox closed");
                        return;
                    };
                    if !self.handle(msg).await {
                        return;
                    }
                }
            }
        }
    }

    /// Process one mailbox message. Returns `false` when a downstream
    /// mailbox has closed and the router should exit.
    async fn handle(&mut self, msg: RouterMessage) -> bool {
        match msg {
            RouterMessage::FrameFromRelay {
                relay_id,
                peer,
                frame,
            } => {
                let clear = match self.unpack(&frame) {
                    Ok(clear) => clear,
                    Err(err) => {
                        tracing::warn!(
                            %err,
                            peer = %peer.debug(),
                            relay = relay_id,
                            frame_len = frame.len(),
                            "dropping undecryptable session frame from relay"
                        );
                        return true;
                    }
                };
                self.deliver(TrafficMessage::FromRelay {
                    relay_id,
                    peer,
                    clear,
                })
                .await
            }
            RouterMessage::FrameFromAddrPort { addr_port, frame } => {
                let clear = match self.unpack(&frame) {
                    Ok(clear) => clear,
                    Err(err) => {
                        tracing::warn!(
                            %err,
                            %addr_port,
                            frame_len = frame.len(),
                            "dropping undecryptable session frame from direct path"
                        );
                        return true;
                    }
                };
                self.deliver(TrafficMessage::FromDirect { addr_port, clear })
                    .await
            }
            RouterMessage::SendToRelay {
                payload,
                to_session,
                relay_id,
                peer,
            } => {
                let frame = match self.pack(&payload, &to_session) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::error!(
                            %err,
                            peer = %peer.debug(),
                            relay = relay_id,
                            "could not seal outbound session message"
                        );
                        return true;
                    }
                };
                if !self.relay.write_to(frame, relay_id, peer).await {
                    self.cancel.cancel("relay manager mailbox closed");
                    return false;
                }
                true
            }
            RouterMessage::SendToDirect {
                payload,
                to_session,
                addr_port,
            } => {
                let frame = match self.pack(&payload, &to_session) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::error!(
                            %err,
                            %addr_port,
                            "could not seal outbound session message"
                        );
                        return true;
                    }
                };
                if !self.direct.write_to(frame, addr_port).await {
                    self.cancel.cancel("direct manager mailbox closed");
                    return false;
                }
                true
            }
        }
    }

    async fn deliver(&self, msg: TrafficMessage) -> bool {
        if self.traffic.deliver(msg).await {
            true
        } else {
            self.cancel.cancel("traffic manager mailbox closed");
            false
        }
    }

    /// Open an inbound frame into a [`ClearMessage`].
    ///
    /// # Panics
    ///
    /// Panics if the frame lacks the session magic: ingress dispatchers
    /// pre-filter by magic, so its absence here is an invariant violation.
    fn unpack(&self, frame: &[u8]) -> Result<ClearMessage, RouterError> {
        assert!(
            has_magic(frame),
            "non-session frame reached the cipher router"
        );

        let parsed = Frame::parse(frame)?;
        let shared = self.keyring.current().shared(&parsed.sender)?;
        let clear_bytes = shared.open(parsed.ciphertext)?;
        let payload = SessionPayload::from_bytes(&clear_bytes)?;

        Ok(ClearMessage {
            session: parsed.sender,
            payload,
        })
    }

    /// Seal a payload for `to_session` and frame it.
    fn pack(
        &self,
        payload: &SessionPayload,
        to_session: &SessionPublic,
    ) -> Result<Vec<u8>, RouterError> {
        let key = self.keyring.current();
        let sealed = key.shared(to_session)?.seal(&payload.to_bytes()?);
        Ok(build_frame(&key.public(), &sealed))
    }
}
