//! Integration tests for the ZeroMQ ROUTER/DEALER links.
//!
//! Tests verify the hello/welcome handshake, unicast and broadcast delivery,
//! and disconnect detection through goodbye frames and heartbeat timeouts.

use std::time::Duration;

use fanout_transport::{
    Link, LinkConfig, LinkEvent, Message, PeerId, TransportError, ZmqCoordinatorLink,
    ZmqExecutorLink,
};

const SETTLE: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(5);

fn config(port: u16) -> LinkConfig {
    LinkConfig {
        endpoint: format!("tcp://127.0.0.1:{port}"),
        heartbeat_interval_ms: 100,
        peer_timeout_ms: 600,
    }
}

async fn next_event(link: &dyn Link) -> LinkEvent {
    tokio::time::timeout(TIMEOUT, link.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("link closed")
}

#[tokio::test]
async fn handshake_assigns_ids_and_delivers_messages() {
    let cfg = config(16800);
    let coord = ZmqCoordinatorLink::bind(&cfg).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let exec = ZmqExecutorLink::connect(&cfg).await.unwrap();
    assert_eq!(exec.local_id(), PeerId(1));
    assert_eq!(next_event(&coord).await, LinkEvent::Connected(PeerId(1)));

    exec.send_to(PeerId::COORDINATOR, Message::new(7, &"up".to_string()).unwrap())
        .await
        .unwrap();
    match next_event(&coord).await {
        LinkEvent::Message { from, message } => {
            assert_eq!(from, PeerId(1));
            assert_eq!(message.protocol, 7);
            assert_eq!(message.decode::<String>().unwrap(), "up");
        }
        other => panic!("unexpected event {other:?}"),
    }

    coord
        .send_to(PeerId(1), Message::new(7, &"down".to_string()).unwrap())
        .await
        .unwrap();
    match next_event(&exec).await {
        LinkEvent::Message { from, message } => {
            assert_eq!(from, PeerId::COORDINATOR);
            assert_eq!(message.decode::<String>().unwrap(), "down");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_reaches_every_executor() {
    let cfg = config(16810);
    let coord = ZmqCoordinatorLink::bind(&cfg).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let a = ZmqExecutorLink::connect(&cfg).await.unwrap();
    let b = ZmqExecutorLink::connect(&cfg).await.unwrap();
    assert!(matches!(next_event(&coord).await, LinkEvent::Connected(_)));
    assert!(matches!(next_event(&coord).await, LinkEvent::Connected(_)));
    assert_ne!(a.local_id(), b.local_id());

    coord.broadcast(Message::from_raw(3, vec![42])).await.unwrap();
    for link in [&a, &b] {
        match next_event(link).await {
            LinkEvent::Message { message, .. } => assert_eq!(message.payload, vec![42]),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn goodbye_is_reported_as_disconnect() {
    let cfg = config(16820);
    let coord = ZmqCoordinatorLink::bind(&cfg).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let exec = ZmqExecutorLink::connect(&cfg).await.unwrap();
    let id = exec.local_id();
    assert_eq!(next_event(&coord).await, LinkEvent::Connected(id));

    exec.close().await;
    assert_eq!(next_event(&coord).await, LinkEvent::Disconnected(id));
    assert!(matches!(
        coord.send_to(id, Message::from_raw(3, vec![])).await,
        Err(TransportError::PeerUnavailable(_))
    ));
}

#[tokio::test]
async fn executor_cannot_address_other_executors() {
    let cfg = config(16830);
    let _coord = ZmqCoordinatorLink::bind(&cfg).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let exec = ZmqExecutorLink::connect(&cfg).await.unwrap();
    assert!(matches!(
        exec.send_to(PeerId(9), Message::from_raw(3, vec![])).await,
        Err(TransportError::PeerUnavailable(PeerId(9)))
    ));
}

#[tokio::test]
async fn connect_without_coordinator_never_yields_a_link() {
    let cfg = config(16840);
    let result = tokio::time::timeout(TIMEOUT, ZmqExecutorLink::connect(&cfg)).await;
    assert!(!matches!(result, Ok(Ok(_))));
}
