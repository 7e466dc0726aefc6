//! The framed control-connection seam.
//!
//! The session engine owns protocol semantics only; the bottom-half
//! transport (framing, handshake, socket management) lives behind
//! [`ControlConn`]. An in-memory [`ChannelConn`] implementation serves
//! tests and in-process wiring.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use trellis_core::{ControlMessage, ProtoError};

/// Capacity of each direction of an in-memory connection.
const CHANNEL_CONN_CAPACITY: usize = 64;

/// Control-connection errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// A deadline-bounded read expired; retriable.
    #[error("read deadline exceeded")]
    DeadlineExceeded,

    /// The connection is closed (locally or by the peer).
    #[error("connection closed")]
    Closed,

    /// The wire bytes did not decode to a control message.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// A framed, bidirectional control connection to one client.
///
/// Writes must be atomic with respect to the connection's framing:
/// concurrent callers may interleave *messages*, never message fragments.
#[async_trait]
pub trait ControlConn: Send + Sync {
    /// Read the next control message.
    ///
    /// With a timeout, expiry yields `ConnError::DeadlineExceeded` and the
    /// connection remains usable. Without one, the call blocks until a
    /// message arrives or the connection fails.
    async fn read(&self, timeout: Option<Duration>) -> Result<ControlMessage, ConnError>;

    /// Write one control message.
    async fn write(&self, msg: &ControlMessage) -> Result<(), ConnError>;

    /// Close the connection. Idempotent; subsequent reads and writes fail
    /// with `ConnError::Closed`.
    fn close(&self);
}

/// In-memory [`ControlConn`] over a pair of bounded channels.
pub struct ChannelConn {
    tx: StdMutex<Option<mpsc::Sender<ControlMessage>>>,
    rx: Mutex<mpsc::Receiver<ControlMessage>>,
    closed: AtomicBool,
}

impl ChannelConn {
    /// Create two connected endpoints.
    ///
    /// Everything written to one endpoint is read from the other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CONN_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CONN_CAPACITY);

        let left = Self {
            tx: StdMutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
            closed: AtomicBool::new(false),
        };
        let right = Self {
            tx: StdMutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
            closed: AtomicBool::new(false),
        };
        (left, right)
    }

    fn sender(&self) -> Result<mpsc::Sender<ControlMessage>, ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ConnError::Closed)
    }
}

#[async_trait]
impl ControlConn for ChannelConn {
    async fn read(&self, timeout: Option<Duration>) -> Result<ControlMessage, ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }

        let mut rx = self.rx.lock().await;
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(ConnError::Closed),
                Err(_) => Err(ConnError::DeadlineExceeded),
            },
            None => rx.recv().await.ok_or(ConnError::Closed),
        }
    }

    async fn write(&self, msg: &ControlMessage) -> Result<(), ConnError> {
        let tx = self.sender()?;
        tx.send(msg.clone()).await.map_err(|_| ConnError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender makes the peer's reads return Closed.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_carries_messages_both_ways() {
        let (client, server) = ChannelConn::pair();

        client
            .write(&ControlMessage::Pong { tx_id: 4 })
            .await
            .unwrap();
        assert_eq!(
            server.read(None).await.unwrap(),
            ControlMessage::Pong { tx_id: 4 }
        );

        server
            .write(&ControlMessage::Ping { tx_id: 5 })
            .await
            .unwrap();
        assert_eq!(
            client.read(None).await.unwrap(),
            ControlMessage::Ping { tx_id: 5 }
        );
    }

    #[tokio::test]
    async fn read_deadline_is_retriable() {
        let (client, server) = ChannelConn::pair();

        let err = server
            .read(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err, ConnError::DeadlineExceeded);

        client
            .write(&ControlMessage::Pong { tx_id: 1 })
            .await
            .unwrap();
        assert!(server.read(Some(Duration::from_millis(100))).await.is_ok());
    }

    #[tokio::test]
    async fn close_fails_both_sides() {
        let (client, server) = ChannelConn::pair();
        client.close();

        assert_eq!(
            client.write(&ControlMessage::Pong { tx_id: 0 }).await,
            Err(ConnError::Closed)
        );
        assert_eq!(server.read(None).await.unwrap_err(), ConnError::Closed);
        // Idempotent.
        client.close();
    }
}
