//! End-to-end cipher router scenarios over in-memory mailboxes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio::sync::mpsc;
use trellis_core::{build_frame, CancelToken, SessionPayload, MAILBOX_CAPACITY};
use trellis_crypto::{NodePublic, SessionKeyring, SessionPrivate};
use trellis_node::{
    CipherRouter, DirectHandle, RelayHandle, RouterHandle, RouterMessage, TrafficHandle,
    TrafficMessage,
};

struct Rig {
    handle: RouterHandle,
    keyring: Arc<SessionKeyring>,
    traffic_rx: mpsc::Receiver<TrafficMessage>,
    cancel: CancelToken,
    _relay_rx: mpsc::Receiver<trellis_node::RelayDatagram>,
    _direct_rx: mpsc::Receiver<trellis_node::DirectDatagram>,
}

fn spawn_router() -> Rig {
    let keyring = Arc::new(SessionKeyring::new(SessionPrivate::generate(&mut OsRng)));
    let (traffic, traffic_rx) = TrafficHandle::channel(MAILBOX_CAPACITY);
    let (relay, relay_rx) = RelayHandle::channel(MAILBOX_CAPACITY);
    let (direct, direct_rx) = DirectHandle::channel(MAILBOX_CAPACITY);
    let cancel = CancelToken::new();

    let (handle, router) =
        CipherRouter::new(keyring.clone(), traffic, relay, direct, cancel.clone());
    router.spawn();

    Rig {
        handle,
        keyring,
        traffic_rx,
        cancel,
        _relay_rx: relay_rx,
        _direct_rx: direct_rx,
    }
}

/// Seal `payload` from `sender` to the rig's router, producing frame bytes.
fn frame_for(rig: &Rig, sender: &SessionPrivate, payload: &SessionPayload) -> Vec<u8> {
    let sealed = sender
        .shared(&rig.keyring.public())
        .unwrap()
        .seal(&payload.to_bytes().unwrap());
    build_frame(&sender.public(), &sealed)
}

#[tokio::test]
async fn relay_frame_reaches_traffic_manager() {
    let mut rig = spawn_router();
    let peer_key = SessionPrivate::generate(&mut OsRng);
    let peer_node = NodePublic::from_bytes([3u8; 32]);

    let payload = SessionPayload::CallMeMaybe {
        endpoints: vec!["198.51.100.4:41641".parse().unwrap()],
    };
    let frame = frame_for(&rig, &peer_key, &payload);

    assert!(
        rig.handle
            .send(RouterMessage::FrameFromRelay {
                relay_id: 7,
                peer: peer_node,
                frame,
            })
            .await
    );

    match rig.traffic_rx.recv().await.unwrap() {
        TrafficMessage::FromRelay {
            relay_id,
            peer,
            clear,
        } => {
            assert_eq!(relay_id, 7);
            assert_eq!(peer, peer_node);
            assert_eq!(clear.session, peer_key.public());
            assert_eq!(clear.payload, payload);
        }
        other => panic!("unexpected traffic message: {other:?}"),
    }

    rig.cancel.cancel("test over");
}

#[tokio::test]
async fn direct_frame_reaches_traffic_manager() {
    let mut rig = spawn_router();
    let peer_key = SessionPrivate::generate(&mut OsRng);
    let from: SocketAddr = "198.51.100.9:5000".parse().unwrap();

    let frame = frame_for(&rig, &peer_key, &SessionPayload::Pong { tx_id: 11 });

    assert!(
        rig.handle
            .send(RouterMessage::FrameFromAddrPort {
                addr_port: from,
                frame,
            })
            .await
    );

    match rig.traffic_rx.recv().await.unwrap() {
        TrafficMessage::FromDirect { addr_port, clear } => {
            assert_eq!(addr_port, from);
            assert_eq!(clear.payload, SessionPayload::Pong { tx_id: 11 });
        }
        other => panic!("unexpected traffic message: {other:?}"),
    }

    rig.cancel.cancel("test over");
}

#[tokio::test]
async fn tampered_frame_is_dropped_and_router_survives() {
    let mut rig = spawn_router();
    let peer_key = SessionPrivate::generate(&mut OsRng);
    let peer_node = NodePublic::from_bytes([9u8; 32]);

    // Flip the last ciphertext byte after sealing.
    let mut frame = frame_for(&rig, &peer_key, &SessionPayload::Ping { tx_id: 1 });
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    assert!(
        rig.handle
            .send(RouterMessage::FrameFromRelay {
                relay_id: 2,
                peer: peer_node,
                frame,
            })
            .await
    );

    // Nothing must reach the traffic manager for the tampered frame.
    let nothing =
        tokio::time::timeout(Duration::from_millis(100), rig.traffic_rx.recv()).await;
    assert!(nothing.is_err(), "tampered frame must not be delivered");

    // The router is still alive and processes the next good frame.
    let good = frame_for(&rig, &peer_key, &SessionPayload::Ping { tx_id: 2 });
    assert!(
        rig.handle
            .send(RouterMessage::FrameFromRelay {
                relay_id: 2,
                peer: peer_node,
                frame: good,
            })
            .await
    );

    match rig.traffic_rx.recv().await.unwrap() {
        TrafficMessage::FromRelay { clear, .. } => {
            assert_eq!(clear.payload, SessionPayload::Ping { tx_id: 2 });
        }
        other => panic!("unexpected traffic message: {other:?}"),
    }

    rig.cancel.cancel("test over");
}

#[tokio::test]
async fn key_rotation_applies_to_subsequent_frames() {
    let mut rig = spawn_router();
    let peer_key = SessionPrivate::generate(&mut OsRng);
    let peer_node = NodePublic::from_bytes([5u8; 32]);

    // Rotate the router's session key, then seal against the new public key.
    let fresh = SessionPrivate::generate(&mut OsRng);
    rig.keyring.rotate(fresh);

    let frame = frame_for(&rig, &peer_key, &SessionPayload::Ping { tx_id: 77 });
    assert!(
        rig.handle
            .send(RouterMessage::FrameFromRelay {
                relay_id: 1,
                peer: peer_node,
                frame,
            })
            .await
    );

    match rig.traffic_rx.recv().await.unwrap() {
        TrafficMessage::FromRelay { clear, .. } => {
            assert_eq!(clear.payload, SessionPayload::Ping { tx_id: 77 });
        }
        other => panic!("unexpected traffic message: {other:?}"),
    }

    rig.cancel.cancel("test over");
}
