//! Registry behavior under concurrent load
//!
//! Many users hammer the worker pool at once; afterwards the tables must be
//! exactly what the sequence of commands implies.

use exchange::core::{RegistryError, SessionIdentity, Targets};
use exchange::registry::{Frame, Registry, RegistryConfig};
use futures::future::join_all;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn registry(workers: usize) -> Registry {
    Registry::start(RegistryConfig {
        workers,
        buffer: 4,
        timeout: Duration::from_secs(5),
        ticket_ttl: Duration::from_secs(60),
    })
}

async fn open(
    registry: &Registry,
    sub: &str,
    group: &str,
) -> (String, mpsc::UnboundedReceiver<Frame>) {
    let session = SessionIdentity::new(sub, group, "");
    let ticket = registry.create_ticket(&session).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    registry.create_connection(sub, &ticket, tx).await.unwrap();
    (ticket.connection_id, rx)
}

#[tokio::test]
async fn test_concurrent_handshakes_and_subscriptions() {
    let registry = registry(4);
    let topic = "exchange/0:lobby";

    let opened = join_all((0..50).map(|i| {
        let registry = registry.clone();
        async move {
            let sub = format!("user-{}", i % 10);
            let (connection_id, rx) = open(&registry, &sub, "g1").await;
            registry
                .add_subscribed_topic(&sub, topic, &Targets::single(connection_id.clone()))
                .await
                .unwrap();
            (sub, connection_id, rx)
        }
    }))
    .await;

    let stats = registry.stats().await.unwrap();
    assert_eq!(stats.subscribers, 10);
    assert_eq!(stats.connections, 50);
    assert_eq!(stats.pending_tickets, 0);

    let targets = registry.get_topic_targets(topic).await.unwrap();
    assert_eq!(targets.len(), 50);
    for (sub, connection_id, _) in &opened {
        assert!(targets.contains(connection_id));
        assert!(
            registry
                .has_subscribed_topic(sub, topic, Some(connection_id))
                .await
                .unwrap()
        );
    }

    join_all(opened.iter().map(|(sub, connection_id, _)| {
        let registry = registry.clone();
        async move { assert_ok!(registry.delete_connection(sub, connection_id).await) }
    }))
    .await;

    let stats = registry.stats().await.unwrap();
    assert_eq!(stats.subscribers, 0);
    assert_eq!(stats.connections, 0);
    assert!(registry.get_topic_targets(topic).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_frames_arrive_in_send_order() {
    let registry = registry(8);
    let (connection_id, mut rx) = open(&registry, "alice", "g1").await;
    let targets = Targets::single(connection_id);

    for i in 0..20u8 {
        let report = registry
            .send_message(&targets, Frame::from(vec![i]))
            .await
            .unwrap();
        assert_eq!(report.sent.len(), 1);
    }

    for i in 0..20u8 {
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[i]);
    }
}

#[tokio::test]
async fn test_fan_out_skips_connections_of_other_processes() {
    let registry = registry(2);
    let (local, mut rx) = open(&registry, "alice", "g1").await;

    let mut targets = Targets::single(local.clone());
    targets.insert("00000000-0000-0000-0000-000000000000");

    let report = registry
        .send_message(&targets, Frame::from(b"hi".to_vec()))
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.sent, vec![local]);
    assert!(report.failed.is_empty());
    assert_eq!(rx.recv().await.unwrap().as_ref(), b"hi");
}

#[tokio::test]
async fn test_role_call_groups() {
    let registry = registry(3);
    let (a, _rx_a) = open(&registry, "alice", "g1").await;
    let (b, _rx_b) = open(&registry, "bob", "g1").await;
    let (_c, _rx_c) = open(&registry, "carol", "g2").await;

    let group = registry.get_group_targets("g1").await.unwrap();
    assert_eq!(group.len(), 2);
    assert!(group.contains(&a));
    assert!(group.contains(&b));

    let user = registry.get_subscribed_targets("alice").await.unwrap();
    assert_eq!(user, Targets::single(a));
}

#[tokio::test]
async fn test_stale_tickets_are_swept() {
    let registry = Registry::start(RegistryConfig {
        workers: 2,
        buffer: 4,
        timeout: Duration::from_secs(5),
        ticket_ttl: Duration::from_millis(20),
    });
    let session = SessionIdentity::new("dave", "g1", "");
    let ticket = registry.create_ticket(&session).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = registry.sweep().await.unwrap();
    assert_eq!(report.expired_tickets, 1);
    assert_eq!(report.dropped_subscribers, 1);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = assert_err!(registry.create_connection("dave", &ticket, tx).await);
    assert!(matches!(err, RegistryError::InvalidTicket(_)));
}
