//! Per-client server session: state, facts, and the driving task.
//!
//! Each connected client is represented by a [`ServerSession`] handle held
//! in the registry, plus a [`SessionTask`] that owns the mailbox receivers
//! and drives the state machine:
//!
//! ```text
//! Authenticate → Greet → Established ⇄ Dangling → ReEstablishing
//!                              │            │
//!                              └────────────┴──→ Deconstructing
//! ```
//!
//! The handle's fields are mutated only by the owning task; other tasks
//! reach a session exclusively through the fan-out methods (`greet`,
//! `update_*`, `bye`, `knock`), which snapshot or queue as the state
//! requires.

use crate::conn::{ConnError, ControlConn};
use crate::delta::PeerDelta;
use crate::error::ControlError;
use crate::hooks::{AuthDirective, SessionId};
use crate::registry::Server;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use trellis_core::{CancelToken, ControlMessage, IpPrefix, RetryStrategy};
use trellis_crypto::{random_id, NodePublic, SessionPublic};

/// Capacity of the resume-handoff channel; one reconnect at a time.
const RESUME_CHANNEL_CAPACITY: usize = 1;

/// Lifecycle states of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the device key and a business-logic verdict.
    Authenticate,
    /// Accepted; sending the logon accept and relay catalogue.
    Greet,
    /// Fully connected; relaying peer-fact updates.
    Established,
    /// Connection lost; session retained for a bounded grace window.
    Dangling,
    /// A reconnect arrived; replaying queued state onto the new connection.
    ReEstablishing,
    /// Terminal; the session is being torn down.
    Deconstructing,
}

impl SessionState {
    /// Is this the terminal state?
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Deconstructing)
    }

    /// Is the session between connections (queueing peer deltas)?
    fn is_detached(&self) -> bool {
        matches!(self, SessionState::Dangling | SessionState::ReEstablishing)
    }
}

/// The peer-visible facts of one session, snapshot under the registry lock
/// whenever another session needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFacts {
    /// Current ephemeral session key.
    pub sess: SessionPublic,
    /// Assigned IPv4 prefix; set at finalize time.
    pub ipv4: Option<IpPrefix>,
    /// Assigned IPv6 prefix; set at finalize time.
    pub ipv6: Option<IpPrefix>,
    /// Home relay id; meaningful once the client reported one.
    pub home_relay: i64,
    /// Currently reachable endpoints, as last reported.
    pub endpoints: Vec<SocketAddr>,
}

/// A reconnect handed to a retained session.
pub(crate) struct ResumeHandoff {
    pub(crate) conn: Arc<dyn ControlConn>,
    pub(crate) sess_key: SessionPublic,
}

/// Receiver halves owned by the session's driving task.
pub(crate) struct SessionReceivers {
    pub(crate) auth_rx: mpsc::Receiver<AuthDirective>,
    pub(crate) resume_rx: mpsc::Receiver<ResumeHandoff>,
}

/// Registry-visible handle for one connected client.
pub struct ServerSession {
    id: SessionId,
    peer: NodePublic,
    state: StdRwLock<SessionState>,
    facts: StdRwLock<PeerFacts>,
    conn: StdRwLock<Arc<dyn ControlConn>>,
    queued_deltas: StdMutex<HashMap<NodePublic, PeerDelta>>,
    cancel: CancelToken,
    auth_tx: mpsc::Sender<AuthDirective>,
    resume_tx: mpsc::Sender<ResumeHandoff>,
    pong_tx: watch::Sender<u64>,
}

impl ServerSession {
    pub(crate) fn new(
        peer: NodePublic,
        sess: SessionPublic,
        conn: Arc<dyn ControlConn>,
        auth_capacity: usize,
    ) -> (Arc<Self>, SessionReceivers) {
        let (auth_tx, auth_rx) = mpsc::channel(auth_capacity);
        let (resume_tx, resume_rx) = mpsc::channel(RESUME_CHANNEL_CAPACITY);
        let (pong_tx, _) = watch::channel(0);

        let session = Arc::new(Self {
            id: SessionId::random(),
            peer,
            state: StdRwLock::new(SessionState::Authenticate),
            facts: StdRwLock::new(PeerFacts {
                sess,
                ipv4: None,
                ipv6: None,
                home_relay: 0,
                endpoints: Vec::new(),
            }),
            conn: StdRwLock::new(conn),
            queued_deltas: StdMutex::new(HashMap::new()),
            cancel: CancelToken::new(),
            auth_tx,
            resume_tx,
            pong_tx,
        });

        (session, SessionReceivers { auth_rx, resume_rx })
    }

    /// Opaque session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Long-lived identity of the client behind this session.
    #[must_use]
    pub fn peer(&self) -> NodePublic {
        self.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Is the session currently Established?
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Atomic copy of the peer-visible facts.
    #[must_use]
    pub fn facts_snapshot(&self) -> PeerFacts {
        self.facts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// This session's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn set_state_local(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn set_prefixes(&self, ipv4: IpPrefix, ipv6: IpPrefix) {
        let mut facts = self.facts.write().unwrap_or_else(|e| e.into_inner());
        facts.ipv4 = Some(ipv4);
        facts.ipv6 = Some(ipv6);
    }

    pub(crate) fn set_endpoints(&self, endpoints: Vec<SocketAddr>) {
        self.facts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .endpoints = endpoints;
    }

    pub(crate) fn set_home_relay(&self, home_relay: i64) {
        self.facts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .home_relay = home_relay;
    }

    pub(crate) fn set_sess_key(&self, sess: SessionPublic) {
        self.facts.write().unwrap_or_else(|e| e.into_inner()).sess = sess;
    }

    pub(crate) fn conn_handle(&self) -> Arc<dyn ControlConn> {
        self.conn.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn replace_conn(&self, conn: Arc<dyn ControlConn>) {
        let old = std::mem::replace(
            &mut *self.conn.write().unwrap_or_else(|e| e.into_inner()),
            conn,
        );
        old.close();
    }

    pub(crate) fn close_conn(&self) {
        self.conn_handle().close();
    }

    pub(crate) async fn write(&self, msg: &ControlMessage) -> Result<(), ConnError> {
        self.conn_handle().write(msg).await
    }

    async fn write_or_log(&self, msg: &ControlMessage) {
        if let Err(err) = self.write(msg).await {
            tracing::debug!(
                peer = %self.peer.debug(),
                kind = msg.kind(),
                %err,
                "dropping write to unreachable session"
            );
        }
    }

    /// Record an inbound pong for any waiting knock.
    pub(crate) fn note_pong(&self, tx_id: u64) {
        self.pong_tx.send_replace(tx_id);
    }

    /// Take the queued deltas, leaving the map empty.
    pub(crate) fn take_deltas(&self) -> HashMap<NodePublic, PeerDelta> {
        std::mem::take(
            &mut *self
                .queued_deltas
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    /// If the session is between connections, coalesce `delta` for `peer`
    /// instead of writing. Returns whether the delta was queued.
    fn queue_if_detached(&self, peer: NodePublic, delta: PeerDelta) -> bool {
        if !self.state().is_detached() {
            return false;
        }
        let mut queued = self
            .queued_deltas
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let entry = queued.entry(peer).or_default();
        *entry = entry.merge(delta);
        true
    }

    pub(crate) async fn offer_directive(&self, directive: AuthDirective) -> bool {
        self.auth_tx.send(directive).await.is_ok()
    }

    /// Offer a reconnect to this session without blocking.
    ///
    /// Fails if a handoff is already pending or the task is gone; the
    /// caller then replaces the session instead.
    pub(crate) fn offer_resume(&self, handoff: ResumeHandoff) -> bool {
        self.resume_tx.try_send(handoff).is_ok()
    }

    /// Tell this session's client about another peer (full fact set).
    pub async fn greet(&self, other: NodePublic, facts: &PeerFacts) {
        if self.queue_if_detached(other, PeerDelta::addition()) {
            return;
        }
        tracing::debug!(
            to = %self.peer.debug(),
            of = %other.debug(),
            "greet"
        );
        self.write_or_log(&ControlMessage::PeerAddition {
            pub_key: other,
            sess_key: facts.sess,
            ipv4: facts
                .ipv4
                .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |p| p.addr),
            ipv6: facts
                .ipv6
                .map_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED), |p| p.addr),
            endpoints: facts.endpoints.clone(),
            home_relay: facts.home_relay,
        })
        .await;
    }

    /// Tell this session's client that `peer`'s endpoints changed.
    pub async fn update_endpoints(&self, peer: NodePublic, endpoints: &[SocketAddr]) {
        let delta = PeerDelta {
            endpoints: true,
            ..PeerDelta::default()
        };
        if self.queue_if_detached(peer, delta) {
            return;
        }
        tracing::debug!(
            to = %self.peer.debug(),
            of = %peer.debug(),
            ?endpoints,
            "update endpoints"
        );
        self.write_or_log(&ControlMessage::PeerUpdate {
            pub_key: peer,
            sess_key: None,
            endpoints: Some(endpoints.to_vec()),
            home_relay: None,
        })
        .await;
    }

    /// Tell this session's client that `peer`'s session key rotated.
    pub async fn update_sess_key(&self, peer: NodePublic, sess_key: SessionPublic) {
        let delta = PeerDelta {
            session: true,
            ..PeerDelta::default()
        };
        if self.queue_if_detached(peer, delta) {
            return;
        }
        tracing::debug!(
            to = %self.peer.debug(),
            of = %peer.debug(),
            sess = %sess_key.debug(),
            "update session key"
        );
        self.write_or_log(&ControlMessage::PeerUpdate {
            pub_key: peer,
            sess_key: Some(sess_key),
            endpoints: None,
            home_relay: None,
        })
        .await;
    }

    /// Tell this session's client that `peer`'s home relay changed.
    pub async fn update_home_relay(&self, peer: NodePublic, home_relay: i64) {
        let delta = PeerDelta {
            relay: true,
            ..PeerDelta::default()
        };
        if self.queue_if_detached(peer, delta) {
            return;
        }
        tracing::debug!(
            to = %self.peer.debug(),
            of = %peer.debug(),
            home_relay,
            "update home relay"
        );
        self.write_or_log(&ControlMessage::PeerUpdate {
            pub_key: peer,
            sess_key: None,
            endpoints: None,
            home_relay: Some(home_relay),
        })
        .await;
    }

    /// Tell this session's client that `peer` is gone.
    pub async fn bye(&self, peer: NodePublic) {
        if self.queue_if_detached(peer, PeerDelta::removal()) {
            return;
        }
        tracing::debug!(to = %self.peer.debug(), of = %peer.debug(), "bye");
        self.write_or_log(&ControlMessage::PeerRemove { pub_key: peer })
            .await;
    }

    /// Liveness probe: send a ping and await the matching pong.
    ///
    /// Returns `true` if the session should be considered dangling (no
    /// pong within `deadline`, or the ping could not be written).
    pub async fn knock(&self, deadline: Duration) -> bool {
        let tx_id = u64::from_be_bytes(random_id());
        let mut pong = self.pong_tx.subscribe();

        if self.write(&ControlMessage::Ping { tx_id }).await.is_err() {
            return true;
        }

        let answered = tokio::time::timeout(deadline, async {
            loop {
                if pong.changed().await.is_err() {
                    return false;
                }
                if *pong.borrow_and_update() == tx_id {
                    return true;
                }
            }
        })
        .await;

        !matches!(answered, Ok(true))
    }
}

/// Outcome of one pass through the established read loop.
enum LoopExit {
    /// The connection failed; the session may dangle.
    ConnLost(ConnError),
    /// A reconnect arrived for this session.
    Resume(ResumeHandoff),
    /// Unrecoverable; carries the terminal cause.
    Fatal(ControlError),
}

/// The driving task of one server session. Owns the mailbox receivers and
/// is the only writer of the session's lifecycle.
pub(crate) struct SessionTask {
    session: Arc<ServerSession>,
    server: Arc<Server>,
    rx: SessionReceivers,
}

impl SessionTask {
    pub(crate) fn new(
        session: Arc<ServerSession>,
        server: Arc<Server>,
        rx: SessionReceivers,
    ) -> Self {
        Self {
            session,
            server,
            rx,
        }
    }

    /// Run the session to termination.
    pub(crate) async fn run(mut self) {
        self.spawn_guardian();
        let cause = self.drive().await;
        self.deconstruct(&cause).await;
    }

    /// Guardian: once the session cancels, deregister and close, exactly
    /// once, regardless of how the main task went down.
    fn spawn_guardian(&self) {
        let session = Arc::clone(&self.session);
        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            session.cancel_token().cancelled().await;
            tracing::info!(
                peer = %session.peer().debug(),
                cause = session.cancel_token().cause().unwrap_or_default(),
                "session exiting"
            );
            server.remove_session(&session).await;
            session.close_conn();
        });
    }

    /// Best-effort reject for a protocol violation, per the error policy:
    /// write one where the connection can still carry it, then deconstruct.
    async fn write_reject_for(&self, err: &ControlError) {
        if matches!(
            err,
            ControlError::ProtocolViolation(_) | ControlError::AuthTimeout
        ) {
            let reject = ControlMessage::LogonReject {
                reason: err.to_string(),
                retry_strategy: RetryStrategy::Backoff,
            };
            let _ = self.session.write(&reject).await;
        }
    }

    /// Drive the state machine until a terminal cause emerges.
    async fn drive(&mut self) -> ControlError {
        if let Err(err) = self.authenticate().await {
            self.write_reject_for(&err).await;
            return err;
        }

        if let Err(err) = self.greet().await {
            return err;
        }

        loop {
            match self.established().await {
                LoopExit::Fatal(err) => {
                    self.write_reject_for(&err).await;
                    return err;
                }
                LoopExit::Resume(handoff) => {
                    if let Err(err) = self.resume(handoff).await {
                        self.write_reject_for(&err).await;
                        return err;
                    }
                }
                LoopExit::ConnLost(err) => {
                    tracing::info!(
                        peer = %self.session.peer().debug(),
                        %err,
                        "control connection lost, session dangling"
                    );
                    self.server
                        .set_state(&self.session, SessionState::Dangling)
                        .await;

                    let grace = self.server.timing().dangling_grace;
                    let handoff = tokio::select! {
                        () = self.session.cancel_token().cancelled() => {
                            return ControlError::Cancelled;
                        }
                        handoff = self.rx.resume_rx.recv() => match handoff {
                            Some(handoff) => handoff,
                            None => {
                                return ControlError::Internal(
                                    "resume channel closed".into(),
                                );
                            }
                        },
                        () = tokio::time::sleep(grace) => {
                            return ControlError::DanglingExpired;
                        }
                    };

                    if let Err(err) = self.resume(handoff).await {
                        self.write_reject_for(&err).await;
                        return err;
                    }
                }
            }
        }
    }

    /// Authenticate phase: wait concurrently for the device key, a
    /// business-logic directive, and read errors, under an overall bound.
    async fn authenticate(&mut self) -> Result<(), ControlError> {
        self.server
            .hooks()
            .on_session_create(self.session.id(), self.session.peer());

        let conn = self.session.conn_handle();
        let poll = self.server.timing().device_key_poll;
        let poll_cancel = CancelToken::new();
        let (key_tx, mut key_rx) = mpsc::channel::<String>(2);
        let (err_tx, mut err_rx) = mpsc::channel::<ControlError>(1);

        // Subordinate reader: polls with a short deadline so it can notice
        // cancellation between reads, and keeps reading so a duplicate
        // device key is caught too.
        let reader = {
            let cancel = poll_cancel.clone();
            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match conn.read(Some(poll)).await {
                        Ok(ControlMessage::LogonDeviceKey { device_key }) => {
                            if key_tx.send(device_key).await.is_err() {
                                return;
                            }
                        }
                        Ok(other) => {
                            let _ = err_tx
                                .send(ControlError::ProtocolViolation(format!(
                                    "unexpected {} during authenticate",
                                    other.kind()
                                )))
                                .await;
                            return;
                        }
                        Err(ConnError::DeadlineExceeded) => {}
                        Err(err) => {
                            tracing::error!(%err, "device-key reader failed");
                            let _ = err_tx.send(err.into()).await;
                            return;
                        }
                    }
                }
            })
        };

        let result = self.authenticate_loop(&mut key_rx, &mut err_rx).await;

        poll_cancel.cancel("authenticate phase over");
        let _ = reader.await;
        result
    }

    async fn authenticate_loop(
        &mut self,
        key_rx: &mut mpsc::Receiver<String>,
        err_rx: &mut mpsc::Receiver<ControlError>,
    ) -> Result<(), ControlError> {
        let deadline =
            tokio::time::Instant::now() + self.server.timing().authenticate_timeout;
        let mut device_key_seen = false;
        let mut auth_url_sent = false;

        loop {
            tokio::select! {
                () = self.session.cancel_token().cancelled() => {
                    return Err(ControlError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(ControlError::AuthTimeout);
                }
                err = err_rx.recv() => {
                    return Err(err.unwrap_or_else(|| {
                        ControlError::Internal("device-key reader gone".into())
                    }));
                }
                key = key_rx.recv() => {
                    let Some(device_key) = key else {
                        return Err(ControlError::Internal(
                            "device-key reader gone".into(),
                        ));
                    };
                    if device_key_seen {
                        return Err(ControlError::ProtocolViolation(
                            "client sent device key twice".into(),
                        ));
                    }
                    device_key_seen = true;
                    self.server
                        .hooks()
                        .on_device_key(self.session.id(), &device_key);
                }
                directive = self.rx.auth_rx.recv() => {
                    let Some(directive) = directive else {
                        return Err(ControlError::Internal(
                            "auth mailbox closed".into(),
                        ));
                    };
                    match directive {
                        AuthDirective::Accept => return Ok(()),
                        AuthDirective::Reject { reason, retry_strategy } => {
                            self.session
                                .write(&ControlMessage::LogonReject {
                                    reason,
                                    retry_strategy,
                                })
                                .await?;
                            return Err(ControlError::LogonRejected);
                        }
                        AuthDirective::AuthUrl { url } => {
                            if auth_url_sent {
                                return Err(ControlError::DirectiveViolation(
                                    "business logic sent auth url twice".into(),
                                ));
                            }
                            auth_url_sent = true;
                            self.session
                                .write(&ControlMessage::LogonAuthenticate {
                                    authenticate_url: url.clone(),
                                })
                                .await?;
                            tracing::debug!(
                                url,
                                peer = %self.session.peer().debug(),
                                "sent auth url"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Greet phase: finalize, accept, send relays, and form pairs under
    /// the registry lock.
    async fn greet(&mut self) -> Result<(), ControlError> {
        let session = &self.session;
        let (ipv4, ipv6) = self
            .server
            .hooks()
            .on_session_finalize(session.id(), session.peer());
        session.set_prefixes(ipv4, ipv6);
        session.set_state_local(SessionState::Greet);

        session
            .write(&ControlMessage::LogonAccept {
                ipv4,
                ipv6,
                session_id: *session.id().as_bytes(),
            })
            .await?;
        session
            .write(&ControlMessage::RelayUpdate {
                relays: self.server.relays(),
            })
            .await?;

        let ops = self.server.pair_snapshot_and_establish(session).await;
        self.server.push_pairs(ops).await;

        tracing::info!(peer = %session.peer().debug(), "established session");
        Ok(())
    }

    /// Established read loop.
    async fn established(&mut self) -> LoopExit {
        loop {
            let conn = self.session.conn_handle();
            tokio::select! {
                () = self.session.cancel_token().cancelled() => {
                    return LoopExit::Fatal(ControlError::Cancelled);
                }
                handoff = self.rx.resume_rx.recv() => {
                    return match handoff {
                        Some(handoff) => LoopExit::Resume(handoff),
                        None => LoopExit::Fatal(ControlError::Internal(
                            "resume channel closed".into(),
                        )),
                    };
                }
                read = conn.read(None) => match read {
                    Err(err) => return LoopExit::ConnLost(err),
                    Ok(msg) => {
                        if let Some(exit) = self.on_established_message(msg).await {
                            return exit;
                        }
                    }
                }
            }
        }
    }

    async fn on_established_message(&mut self, msg: ControlMessage) -> Option<LoopExit> {
        match msg {
            ControlMessage::EndpointUpdate { endpoints: None } => {
                tracing::warn!(
                    peer = %self.session.peer().debug(),
                    "received endpoint update without endpoints"
                );
                None
            }
            ControlMessage::EndpointUpdate {
                endpoints: Some(endpoints),
            } => {
                self.apply_endpoints(endpoints).await;
                None
            }
            ControlMessage::HomeRelayUpdate { home_relay } => {
                self.apply_home_relay(home_relay).await;
                None
            }
            ControlMessage::Pong { tx_id } => {
                self.session.note_pong(tx_id);
                None
            }
            other => Some(LoopExit::Fatal(ControlError::ProtocolViolation(format!(
                "unexpected {} while established",
                other.kind()
            )))),
        }
    }

    async fn apply_endpoints(&self, endpoints: Vec<SocketAddr>) {
        tracing::debug!(
            peer = %self.session.peer().debug(),
            ?endpoints,
            "received endpoints"
        );
        self.session.set_endpoints(endpoints.clone());
        for other in self.server.visible_live(&self.session).await {
            other.update_endpoints(self.session.peer(), &endpoints).await;
        }
    }

    async fn apply_home_relay(&self, home_relay: i64) {
        tracing::debug!(
            peer = %self.session.peer().debug(),
            home_relay,
            "received home relay"
        );
        self.session.set_home_relay(home_relay);
        for other in self.server.visible_live(&self.session).await {
            other.update_home_relay(self.session.peer(), home_relay).await;
        }
    }

    /// Re-establish on a fresh connection: broadcast a key change, drain
    /// queued deltas, wait briefly for the client's refresh, re-pair.
    async fn resume(&mut self, handoff: ResumeHandoff) -> Result<(), ControlError> {
        let session = Arc::clone(&self.session);
        tracing::info!(peer = %session.peer().debug(), "resuming session");

        self.server
            .set_state(&session, SessionState::ReEstablishing)
            .await;
        self.server
            .hooks()
            .on_session_resume(session.id(), session.peer());

        let old_key = session.facts_snapshot().sess;
        session.replace_conn(handoff.conn);

        if handoff.sess_key != old_key {
            session.set_sess_key(handoff.sess_key);
            for other in self.server.visible_live(&session).await {
                other.update_sess_key(session.peer(), handoff.sess_key).await;
            }
        }

        self.drain_deltas().await;
        self.await_refresh().await?;

        let ops = self.server.pair_snapshot_and_establish(&session).await;
        self.server.push_pairs(ops).await;

        // Anything queued between the drain and the state flip.
        self.drain_deltas().await;

        tracing::info!(peer = %session.peer().debug(), "re-established session");
        Ok(())
    }

    /// Replay queued deltas onto the current connection until none remain.
    async fn drain_deltas(&mut self) {
        loop {
            let drained = self.session.take_deltas();
            if drained.is_empty() {
                return;
            }
            for (node, delta) in drained {
                self.replay_delta(node, delta).await;
            }
        }
    }

    async fn replay_delta(&self, node: NodePublic, delta: PeerDelta) {
        if delta.remove {
            self.session
                .write_or_log(&ControlMessage::PeerRemove { pub_key: node })
                .await;
            return;
        }

        let Some(other) = self.server.get(&node).await else {
            tracing::debug!(
                peer = %node.debug(),
                "skipping delta replay for departed peer"
            );
            return;
        };
        let facts = other.facts_snapshot();

        if delta.add {
            self.session.greet(node, &facts).await;
        } else {
            self.session
                .write_or_log(&ControlMessage::PeerUpdate {
                    pub_key: node,
                    sess_key: delta.session.then_some(facts.sess),
                    endpoints: delta.endpoints.then(|| facts.endpoints.clone()),
                    home_relay: delta.relay.then_some(facts.home_relay),
                })
                .await;
        }
    }

    /// Wait up to the resume window for `EndpointUpdate` and
    /// `HomeRelayUpdate`, then proceed with whatever is known.
    async fn await_refresh(&mut self) -> Result<(), ControlError> {
        let deadline = tokio::time::Instant::now() + self.server.timing().resume_wait;
        let mut have_endpoints = false;
        let mut have_relay = false;

        while !(have_endpoints && have_relay) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let conn = self.session.conn_handle();
            match conn.read(Some(remaining)).await {
                Ok(ControlMessage::EndpointUpdate {
                    endpoints: Some(endpoints),
                }) => {
                    self.apply_endpoints(endpoints).await;
                    have_endpoints = true;
                }
                Ok(ControlMessage::EndpointUpdate { endpoints: None }) => {
                    tracing::warn!(
                        peer = %self.session.peer().debug(),
                        "received endpoint update without endpoints"
                    );
                }
                Ok(ControlMessage::HomeRelayUpdate { home_relay }) => {
                    self.apply_home_relay(home_relay).await;
                    have_relay = true;
                }
                Ok(ControlMessage::Pong { tx_id }) => self.session.note_pong(tx_id),
                Ok(other) => {
                    return Err(ControlError::ProtocolViolation(format!(
                        "unexpected {} while re-establishing",
                        other.kind()
                    )));
                }
                Err(ConnError::DeadlineExceeded) => break,
                Err(err) => return Err(err.into()),
            }
        }

        if !(have_endpoints && have_relay) {
            tracing::debug!(
                peer = %self.session.peer().debug(),
                have_endpoints,
                have_relay,
                "resume refresh incomplete, proceeding with known facts"
            );
        }
        Ok(())
    }

    /// Terminal teardown: tell visible peers, then cancel.
    async fn deconstruct(&self, cause: &ControlError) {
        self.server
            .set_state(&self.session, SessionState::Deconstructing)
            .await;

        // A replacement session for the same node announces itself; a
        // goodbye from us would race its additions.
        let replaced = match self.server.get(&self.session.peer()).await {
            Some(current) => current.id() != self.session.id(),
            None => false,
        };
        if !replaced {
            for other in self.server.visible_live(&self.session).await {
                other.bye(self.session.peer()).await;
            }
        }

        self.session
            .cancel_token()
            .cancel(format!("main run loop exited: {cause}"));
    }
}
