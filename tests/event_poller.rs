//! Event poller fan-out over a live connection

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{connect_pair, entry, search_done};
use ldap_protocol::config::ClientConfig;
use ldap_protocol::error::LdapError;
use ldap_protocol::protocol::message::{ProtocolOp, SearchRequest, SearchScope};
use ldap_protocol::protocol::Filter;
use ldap_protocol::service::{PollEvent, Subscription};

fn fast_polling() -> ClientConfig {
    ClientConfig {
        poll_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

fn persistent_search() -> SearchRequest {
    SearchRequest::new("ou=people,dc=example,dc=com", SearchScope::SingleLevel, Filter::any_object())
}

async fn next_event(sub: &mut Subscription) -> PollEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("no event within five seconds")
        .expect("poller closed")
}

fn entry_dn(event: PollEvent) -> String {
    match event {
        PollEvent::Entry(msg) => match msg.op {
            ProtocolOp::SearchResultEntry(e) => e.dn,
            other => panic!("unexpected op {other:?}"),
        },
        other => panic!("expected entry, got {other:?}"),
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_every_entry() {
    let (conn, mut server) = connect_pair(fast_polling());
    let poller = conn.event_poller(persistent_search(), Vec::new()).await.unwrap();
    let id = server.recv().await.message_id;
    assert_eq!(poller.message_id().await, id);

    let mut first = poller.subscribe().unwrap();
    let mut second = poller.subscribe().unwrap();
    assert_eq!(poller.start_count(), 1);

    server.send(entry(id, "uid=a")).await;
    server.send(entry(id, "uid=b")).await;

    for sub in [&mut first, &mut second] {
        assert_eq!(entry_dn(next_event(sub).await), "uid=a");
        assert_eq!(entry_dn(next_event(sub).await), "uid=b");
    }

    server.send(search_done(id)).await;
    for sub in [&mut first, &mut second] {
        assert!(matches!(next_event(sub).await, PollEvent::Done(_)));
    }
}

#[tokio::test]
async fn test_polling_follows_subscriber_count() {
    let (conn, mut server) = connect_pair(fast_polling());
    let poller = conn.event_poller(persistent_search(), Vec::new()).await.unwrap();
    let id = server.recv().await.message_id;
    assert!(!poller.is_running());

    let sub = poller.subscribe().unwrap();
    assert!(poller.is_running());
    drop(sub);
    assert!(!poller.is_running());
    assert_eq!(poller.subscriber_count(), 0);

    // Entries queue on the response stream while nobody listens
    server.send(entry(id, "uid=queued")).await;

    let mut sub = poller.subscribe().unwrap();
    assert_eq!(poller.start_count(), 2);
    assert_eq!(entry_dn(next_event(&mut sub).await), "uid=queued");
}

#[tokio::test]
async fn test_connection_loss_is_reported() {
    let (conn, mut server) = connect_pair(fast_polling());
    let poller = conn.event_poller(persistent_search(), Vec::new()).await.unwrap();
    server.recv().await;

    let mut sub = poller.subscribe().unwrap();
    drop(server);

    match next_event(&mut sub).await {
        PollEvent::Error(e) => assert!(matches!(*e, LdapError::ConnectionClosed)),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_returns_none_after_done_and_poller_drop() {
    let (conn, mut server) = connect_pair(fast_polling());
    let poller = conn.event_poller(persistent_search(), Vec::new()).await.unwrap();
    let id = server.recv().await.message_id;
    let mut sub = poller.subscribe().unwrap();

    server.send(entry(id, "uid=only")).await;
    server.send(search_done(id)).await;
    assert_eq!(entry_dn(next_event(&mut sub).await), "uid=only");
    assert!(matches!(next_event(&mut sub).await, PollEvent::Done(_)));

    drop(poller);
    let after = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await;
    assert!(matches!(after, Ok(None)));
}

#[tokio::test]
async fn test_dropping_poller_wakes_waiting_subscriber() {
    let (conn, mut server) = connect_pair(fast_polling());
    let poller = conn.event_poller(persistent_search(), Vec::new()).await.unwrap();
    server.recv().await;
    let mut sub = poller.subscribe().unwrap();

    let waiter = tokio::spawn(async move { sub.recv().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(poller);

    let received = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("subscriber still waiting")
        .unwrap();
    assert!(received.is_none());
}
