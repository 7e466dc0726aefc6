//! The process-wide server: session registry, visibility engine, and
//! pair-operation broadcasting.
//!
//! The registry map and the visibility oracle sit behind one logical
//! read-write lock. Pair formation takes it exclusively (it also reads
//! peer state and flips the joining session to Established before the lock
//! is released); fan-out traversals take it shared and snapshot what they
//! need.

use crate::conn::ControlConn;
use crate::error::ControlError;
use crate::hooks::{AuthDirective, PairOperation, SessionHooks, SessionId, VisibilityOracle, VisibilityPair};
use crate::session::{ResumeHandoff, ServerSession, SessionState, SessionTask};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use trellis_core::{spawn_supervised, ControlTiming, RelayInfo, RetryStrategy};
use trellis_crypto::{NodePublic, SessionPublic};

#[derive(Default)]
struct Registry {
    by_node: HashMap<NodePublic, Arc<ServerSession>>,
    by_id: HashMap<SessionId, Arc<ServerSession>>,
}

/// The control-plane server.
pub struct Server {
    registry: RwLock<Registry>,
    oracle: Arc<dyn VisibilityOracle>,
    hooks: Arc<dyn SessionHooks>,
    relays: StdRwLock<Vec<RelayInfo>>,
    pair_tx: mpsc::Sender<Vec<PairOperation>>,
    pair_rx: Mutex<Option<mpsc::Receiver<Vec<PairOperation>>>>,
    timing: ControlTiming,
}

impl Server {
    /// Create a server around a visibility oracle and callback surface.
    #[must_use]
    pub fn new(
        oracle: Arc<dyn VisibilityOracle>,
        hooks: Arc<dyn SessionHooks>,
        timing: ControlTiming,
    ) -> Arc<Self> {
        let (pair_tx, pair_rx) = mpsc::channel(timing.pair_channel_capacity);
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            oracle,
            hooks,
            relays: StdRwLock::new(Vec::new()),
            pair_tx,
            pair_rx: Mutex::new(Some(pair_rx)),
            timing,
        })
    }

    /// The server's timing configuration.
    #[must_use]
    pub fn timing(&self) -> &ControlTiming {
        &self.timing
    }

    pub(crate) fn hooks(&self) -> &dyn SessionHooks {
        self.hooks.as_ref()
    }

    /// The current relay catalogue.
    #[must_use]
    pub fn relays(&self) -> Vec<RelayInfo> {
        self.relays.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the relay catalogue sent to clients at greet time.
    pub fn set_relays(&self, relays: Vec<RelayInfo>) {
        *self.relays.write().unwrap_or_else(|e| e.into_inner()) = relays;
    }

    /// Entry point for a new inbound control connection whose transport
    /// handshake identified `(node_key, sess_key)`.
    ///
    /// A retained non-terminal session for the same node key receives the
    /// connection as a resume handoff; otherwise a fresh session is
    /// registered and its task spawned. Either way the node key maps to at
    /// most one non-terminal session afterwards.
    pub async fn handle_connection(
        self: &Arc<Self>,
        conn: Arc<dyn ControlConn>,
        node_key: NodePublic,
        sess_key: SessionPublic,
    ) -> Arc<ServerSession> {
        let existing = self.get(&node_key).await;
        if let Some(existing) = existing {
            if !existing.state().is_terminal()
                && existing.offer_resume(ResumeHandoff {
                    conn: Arc::clone(&conn),
                    sess_key,
                })
            {
                tracing::info!(
                    peer = %node_key.debug(),
                    "handed reconnect to retained session"
                );
                return existing;
            }
        }

        let (session, rx) =
            ServerSession::new(node_key, sess_key, conn, self.timing.auth_mailbox_capacity);

        {
            let mut reg = self.registry.write().await;
            if let Some(old) = reg.by_node.insert(node_key, Arc::clone(&session)) {
                reg.by_id.remove(&old.id());
                old.cancel_token().cancel("replaced by new connection");
            }
            reg.by_id.insert(session.id(), Arc::clone(&session));
        }

        tracing::info!(
            peer = %node_key.debug(),
            sess = %session.id().debug(),
            "registered new session"
        );

        let task = SessionTask::new(Arc::clone(&session), Arc::clone(self), rx);
        spawn_supervised(
            "server-session",
            session.cancel_token().clone(),
            task.run(),
        );

        session
    }

    /// Look up the session for a node key.
    pub async fn get(&self, node: &NodePublic) -> Option<Arc<ServerSession>> {
        self.registry.read().await.by_node.get(node).cloned()
    }

    /// Look up a session by its opaque id.
    pub async fn get_by_id(&self, id: &SessionId) -> Option<Arc<ServerSession>> {
        self.registry.read().await.by_id.get(id).cloned()
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.by_node.len()
    }

    /// Remove a session. Idempotent; a newer session registered under the
    /// same node key is left untouched.
    pub async fn remove_session(&self, session: &ServerSession) {
        let mut reg = self.registry.write().await;
        if let Some(current) = reg.by_node.get(&session.peer()) {
            if current.id() == session.id() {
                reg.by_node.remove(&session.peer());
            }
        }
        reg.by_id.remove(&session.id());
    }

    /// Apply an externally observable state transition under the registry
    /// write lock, so concurrent pair formation sees a consistent view.
    pub async fn set_state(&self, session: &ServerSession, state: SessionState) {
        let _reg = self.registry.write().await;
        session.set_state_local(state);
    }

    /// Run `f` with the visibility map for `peer` and the session set,
    /// under the exclusive registry lock.
    ///
    /// This is the pair-formation primitive: because the lock is held
    /// across the visibility read, the peer-state reads, and any state
    /// transition `f` performs, no two sessions can observe each other
    /// half-established.
    pub async fn sess_locked_do_visibility_pairs<T>(
        &self,
        peer: &NodePublic,
        f: impl FnOnce(
            &HashMap<NodePublic, VisibilityPair>,
            &HashMap<NodePublic, Arc<ServerSession>>,
        ) -> T,
    ) -> T {
        let reg = self.registry.write().await;
        let vis = self.oracle.visible_to(peer);
        f(&vis, &reg.by_node)
    }

    /// Snapshot the live sessions visible to `session`: Established peers
    /// plus Dangling / ReEstablishing ones, which coalesce writes into
    /// their delta queues instead of hitting a dead connection.
    ///
    /// Callers iterate the returned handles without holding the registry
    /// lock, so they must tolerate a peer deconstructing underneath them
    /// (its writes become no-ops).
    pub async fn visible_live(&self, session: &ServerSession) -> Vec<Arc<ServerSession>> {
        let reg = self.registry.read().await;
        let vis = self.oracle.visible_to(&session.peer());

        vis.keys()
            .filter(|node| **node != session.peer())
            .filter_map(|node| reg.by_node.get(node))
            .filter(|other| {
                matches!(
                    other.state(),
                    SessionState::Established
                        | SessionState::Dangling
                        | SessionState::ReEstablishing
                ) && other.id() != session.id()
            })
            .cloned()
            .collect()
    }

    /// Form pairs for `session` against every visible Established peer and
    /// flip `session` to Established, atomically under the registry lock.
    pub(crate) async fn pair_snapshot_and_establish(
        &self,
        session: &Arc<ServerSession>,
    ) -> Vec<PairOperation> {
        let session = Arc::clone(session);
        let peer = session.peer();
        self.sess_locked_do_visibility_pairs(&peer, move |vis, sessions| {
            let mut ops = Vec::new();
            for (node, pair) in vis {
                if *node == peer {
                    continue;
                }
                let Some(other) = sessions.get(node) else {
                    continue;
                };
                if other.is_established() {
                    ops.push(PairOperation {
                        a: session.id(),
                        b: other.id(),
                        a_node: peer,
                        b_node: other.peer(),
                        pair: pair.clone(),
                    });
                }
            }
            session.set_state_local(SessionState::Established);
            ops
        })
        .await
    }

    /// Queue pair operations for the broadcast worker.
    pub(crate) async fn push_pairs(&self, ops: Vec<PairOperation>) {
        if ops.is_empty() {
            return;
        }
        if self.pair_tx.send(ops).await.is_err() {
            tracing::warn!("pair channel closed, dropping pair operations");
        }
    }

    /// Take the pair-operation receiver for an external broadcast worker.
    ///
    /// Returns `None` if it was already taken (or the built-in broadcaster
    /// was spawned).
    pub async fn take_pair_operations(&self) -> Option<mpsc::Receiver<Vec<PairOperation>>> {
        self.pair_rx.lock().await.take()
    }

    /// Spawn the built-in pair-broadcast worker: each operation makes both
    /// sides greet the other with a `PeerAddition`.
    pub fn spawn_pair_broadcaster(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut rx) = server.take_pair_operations().await else {
                tracing::warn!("pair operations already consumed elsewhere");
                return;
            };
            while let Some(ops) = rx.recv().await {
                for op in ops {
                    server.broadcast_pair(&op).await;
                }
            }
        })
    }

    async fn broadcast_pair(&self, op: &PairOperation) {
        let (a, b) = {
            let reg = self.registry.read().await;
            (
                reg.by_id.get(&op.a).cloned(),
                reg.by_id.get(&op.b).cloned(),
            )
        };
        let (Some(a), Some(b)) = (a, b) else {
            tracing::debug!(
                a = %op.a_node.debug(),
                b = %op.b_node.debug(),
                "pair operation references a departed session"
            );
            return;
        };

        tracing::debug!(
            a = %op.a_node.debug(),
            b = %op.b_node.debug(),
            "announcing pair"
        );

        let a_facts = a.facts_snapshot();
        let b_facts = b.facts_snapshot();
        a.greet(b.peer(), &b_facts).await;
        b.greet(a.peer(), &a_facts).await;
    }

    /// Spawn a periodic liveness sweep that knocks Established sessions
    /// and drops unresponsive ones to Dangling.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let sessions: Vec<_> = {
                    let reg = server.registry.read().await;
                    reg.by_node.values().cloned().collect()
                };

                for session in sessions {
                    if !session.is_established() {
                        continue;
                    }
                    if session.knock(server.timing.knock_deadline).await {
                        tracing::info!(
                            peer = %session.peer().debug(),
                            "knock unanswered, dropping session to dangling"
                        );
                        server.set_state(&session, SessionState::Dangling).await;
                        session.close_conn();
                    }
                }
            }
        })
    }

    /// Accept a session's logon.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownSession` if the session is gone.
    pub async fn accept_auth(&self, sess: SessionId) -> Result<(), ControlError> {
        self.directive(sess, AuthDirective::Accept).await
    }

    /// Reject a session's logon.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownSession` if the session is gone.
    pub async fn reject_auth(
        &self,
        sess: SessionId,
        reason: String,
        retry_strategy: RetryStrategy,
    ) -> Result<(), ControlError> {
        self.directive(
            sess,
            AuthDirective::Reject {
                reason,
                retry_strategy,
            },
        )
        .await
    }

    /// Ask a session's client to authenticate interactively.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownSession` if the session is gone.
    pub async fn send_auth_url(&self, sess: SessionId, url: String) -> Result<(), ControlError> {
        self.directive(sess, AuthDirective::AuthUrl { url }).await
    }

    async fn directive(
        &self,
        sess: SessionId,
        directive: AuthDirective,
    ) -> Result<(), ControlError> {
        let session = self
            .get_by_id(&sess)
            .await
            .ok_or(ControlError::UnknownSession)?;
        if session.offer_directive(directive).await {
            Ok(())
        } else {
            Err(ControlError::UnknownSession)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ChannelConn;
    use trellis_core::IpPrefix;

    struct EveryoneVisible;

    impl VisibilityOracle for EveryoneVisible {
        fn visible_to(&self, peer: &NodePublic) -> HashMap<NodePublic, VisibilityPair> {
            // Symmetric by construction: everyone sees node 1 and node 2.
            let mut map = HashMap::new();
            for byte in [1u8, 2u8] {
                let node = NodePublic::from_bytes([byte; 32]);
                if node != *peer {
                    map.insert(node, VisibilityPair::default());
                }
            }
            map
        }
    }

    struct AutoAccept;

    impl SessionHooks for AutoAccept {
        fn on_session_create(&self, _sess: SessionId, _client: NodePublic) {}
        fn on_session_resume(&self, _sess: SessionId, _client: NodePublic) {}
        fn on_device_key(&self, _sess: SessionId, _device_key: &str) {}
        fn on_session_finalize(
            &self,
            _sess: SessionId,
            client: NodePublic,
        ) -> (IpPrefix, IpPrefix) {
            let last = client.as_bytes()[0];
            (
                IpPrefix::new(format!("10.64.0.{last}").parse().unwrap(), 32),
                IpPrefix::new(format!("fd7a::{last:x}").parse().unwrap(), 128),
            )
        }
    }

    fn make_server() -> Arc<Server> {
        Server::new(
            Arc::new(EveryoneVisible),
            Arc::new(AutoAccept),
            ControlTiming::default(),
        )
    }

    #[tokio::test]
    async fn add_then_remove_restores_empty_registry() {
        let server = make_server();
        let (server_end, _client_end) = ChannelConn::pair();
        let node = NodePublic::from_bytes([1u8; 32]);
        let sess = SessionPublic::from_bytes([7u8; 32]);

        let session = server
            .handle_connection(Arc::new(server_end), node, sess)
            .await;
        assert_eq!(server.session_count().await, 1);
        assert!(server.get(&node).await.is_some());
        assert!(server.get_by_id(&session.id()).await.is_some());

        server.remove_session(&session).await;
        assert_eq!(server.session_count().await, 0);
        assert!(server.get(&node).await.is_none());
        assert!(server.get_by_id(&session.id()).await.is_none());

        // Removal is idempotent.
        server.remove_session(&session).await;
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn removed_session_is_not_visible() {
        let server = make_server();
        let (a_end, _a_client) = ChannelConn::pair();
        let (b_end, _b_client) = ChannelConn::pair();

        let node_a = NodePublic::from_bytes([1u8; 32]);
        let node_b = NodePublic::from_bytes([2u8; 32]);

        let a = server
            .handle_connection(
                Arc::new(a_end),
                node_a,
                SessionPublic::from_bytes([11u8; 32]),
            )
            .await;
        let b = server
            .handle_connection(
                Arc::new(b_end),
                node_b,
                SessionPublic::from_bytes([12u8; 32]),
            )
            .await;

        server.set_state(&a, SessionState::Established).await;
        server.set_state(&b, SessionState::Established).await;

        let visible = server.visible_live(&a).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].peer(), node_b);

        server.remove_session(&b).await;
        assert!(server.visible_live(&a).await.is_empty());
    }

    #[tokio::test]
    async fn directive_to_unknown_session_fails() {
        let server = make_server();
        let unknown = SessionId::random();
        assert_eq!(
            server.accept_auth(unknown).await,
            Err(ControlError::UnknownSession)
        );
    }
}
