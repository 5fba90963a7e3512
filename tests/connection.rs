//! Connection behaviour against a scripted in-memory server

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;

use common::{connect_pair, default_pair, entry, eventually, result, search_done};
use ldap_protocol::config::ClientConfig;
use ldap_protocol::error::{DecodingErrorKind, LdapError};
use ldap_protocol::protocol::message::{
    oids, BindAuthentication, BindResponse, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp,
    ResultCode, SearchRequest, SearchScope,
};
use ldap_protocol::protocol::Filter;
use ldap_protocol::sasl::SaslRequest;
use ldap_protocol::service::ConnectionState;

fn subtree_search() -> SearchRequest {
    SearchRequest::new("dc=example,dc=com", SearchScope::WholeSubtree, Filter::any_object())
}

fn bind_ok(creds: Option<Vec<u8>>) -> ProtocolOp {
    ProtocolOp::BindResponse(BindResponse {
        result: LdapResult::success(),
        server_sasl_creds: creds,
    })
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_ids() {
    let (conn, mut server) = default_pair();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.delete(&format!("cn={i},dc=example,dc=com")).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..10 {
        requests.push(server.recv().await);
    }
    let ids: HashSet<i32> = requests.iter().map(|m| m.message_id).collect();
    assert_eq!(ids.len(), 10);
    assert!(!ids.contains(&0));

    // Answer out of order
    for msg in requests.iter().rev() {
        server
            .reply(msg.message_id, ProtocolOp::DelResponse(LdapResult::success()))
            .await;
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.metrics().snapshot().operations_issued, 10);
}

#[tokio::test]
async fn test_search_stream_preserves_arrival_order() {
    let (conn, mut server) = default_pair();
    let mut stream = conn.search_stream(subtree_search()).await.unwrap();
    let id = server.recv().await.message_id;
    assert_eq!(stream.message_id(), id);

    server.send(entry(id, "cn=1")).await;
    server
        .reply(
            id,
            ProtocolOp::SearchResultReference(vec!["ldap://b.example.com/".into()]),
        )
        .await;
    server.send(entry(id, "cn=2")).await;
    server.send(search_done(id)).await;

    let mut names = Vec::new();
    while let Some(item) = stream.next().await {
        names.push(item.unwrap().op.name());
    }
    assert_eq!(
        names,
        [
            "searchResEntry",
            "searchResRef",
            "searchResEntry",
            "searchResDone"
        ]
    );
    assert!(stream.is_finished());
}

#[tokio::test]
async fn test_search_collects_entries_and_references() {
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.search(subtree_search()).await }
    });

    let id = server.recv().await.message_id;
    server.send(entry(id, "cn=a")).await;
    server
        .reply(
            id,
            ProtocolOp::SearchResultReference(vec!["ldap://x/".into(), "ldap://y/".into()]),
        )
        .await;
    server.send(entry(id, "cn=b")).await;
    server.send(search_done(id)).await;

    let found = task.await.unwrap().unwrap();
    let dns: Vec<_> = found.entries.iter().map(|e| e.dn.as_str()).collect();
    assert_eq!(dns, ["cn=a", "cn=b"]);
    assert_eq!(found.references, ["ldap://x/", "ldap://y/"]);
    assert!(found.result.is_success());
}

#[tokio::test]
async fn test_search_failure_code_is_an_error() {
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.search(subtree_search()).await }
    });
    let id = server.recv().await.message_id;
    server
        .reply(
            id,
            ProtocolOp::SearchResultDone(result(ResultCode::NoSuchObject)),
        )
        .await;

    match task.await.unwrap() {
        Err(LdapError::Result { code, .. }) => assert_eq!(code, ResultCode::NoSuchObject),
        other => panic!("expected noSuchObject, got {other:?}"),
    }
    // Result codes never close the connection
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_abandon_fails_waiter_and_discards_late_responses() {
    let (conn, mut server) = default_pair();
    let mut stream = conn.search_stream(subtree_search()).await.unwrap();
    let id = stream.message_id();
    assert!(matches!(server.recv().await.op, ProtocolOp::SearchRequest(_)));

    assert!(conn.abandon(id).await.unwrap());
    match stream.next().await {
        Some(Err(LdapError::Abandoned(abandoned))) => assert_eq!(abandoned, id),
        other => panic!("expected Abandoned, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    let abandon = server.recv().await;
    assert_ne!(abandon.message_id, id);
    assert_eq!(abandon.op, ProtocolOp::AbandonRequest(id));

    server.send(entry(id, "cn=late")).await;
    assert!(eventually(|| conn.metrics().snapshot().responses_discarded == 1).await);

    assert!(!conn.abandon(id).await.unwrap());
    assert!(!conn.abandon(9999).await.unwrap());
    assert_eq!(conn.metrics().snapshot().abandons, 1);
}

#[tokio::test]
async fn test_operation_timeout_leaves_connection_usable() {
    let config = ClientConfig {
        operation_timeout: Duration::from_millis(50),
        timeout_sweep_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    };
    let (conn, mut server) = connect_pair(config);

    let slow = tokio::spawn({
        let conn = conn.clone();
        async move { conn.delete("cn=slow").await }
    });
    let slow_id = server.recv().await.message_id;
    assert!(matches!(slow.await.unwrap(), Err(LdapError::Timeout)));
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.state(), ConnectionState::Connected);

    let fast = tokio::spawn({
        let conn = conn.clone();
        async move { conn.delete("cn=fast").await }
    });
    let fast_id = server.recv().await.message_id;
    server
        .reply(slow_id, ProtocolOp::DelResponse(LdapResult::success()))
        .await;
    server
        .reply(fast_id, ProtocolOp::DelResponse(LdapResult::success()))
        .await;

    assert!(fast.await.unwrap().is_ok());
    assert!(conn.metrics().snapshot().timeouts >= 1);
}

#[tokio::test]
async fn test_unsolicited_notification_is_broadcast() {
    let (conn, mut server) = default_pair();
    let mut notifications = conn.subscribe_notifications();

    server
        .reply(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                name: Some("1.3.6.1.4.1.99999.1".into()),
                value: Some(b"ping".to_vec()),
            }),
        )
        .await;

    let msg = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(msg.is_unsolicited());
    assert!(!msg.is_notice_of_disconnection());
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.metrics().snapshot().unsolicited_notifications, 1);
}

#[tokio::test]
async fn test_notification_stream_yields_unsolicited_messages() {
    let (conn, mut server) = default_pair();
    let mut stream = conn.notification_stream();

    for name in ["1.3.6.1.4.1.99999.1", "1.3.6.1.4.1.99999.2"] {
        server
            .reply(
                0,
                ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::success(),
                    name: Some(name.into()),
                    value: None,
                }),
            )
            .await;
    }

    for expected in ["1.3.6.1.4.1.99999.1", "1.3.6.1.4.1.99999.2"] {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        match msg.op {
            ProtocolOp::ExtendedResponse(ext) => assert_eq!(ext.name.as_deref(), Some(expected)),
            other => panic!("unexpected op {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_notice_of_disconnection_closes_connection() {
    let (conn, mut server) = default_pair();
    let mut notifications = conn.subscribe_notifications();
    let pending = conn
        .begin(ProtocolOp::DelRequest("cn=x".into()), Vec::new())
        .await
        .unwrap();
    server.recv().await;

    server
        .send(LdapMessage::new(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: result(ResultCode::Unavailable),
                name: Some(oids::NOTICE_OF_DISCONNECTION.into()),
                value: None,
            }),
        ))
        .await;

    assert!(matches!(
        pending.wait().await,
        Err(LdapError::ConnectionClosed)
    ));
    assert!(notifications.recv().await.unwrap().is_notice_of_disconnection());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.delete("cn=y").await,
        Err(LdapError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_undecodable_frame_closes_connection() {
    let (conn, mut server) = default_pair();
    let pending = conn
        .begin(ProtocolOp::DelRequest("cn=x".into()), Vec::new())
        .await
        .unwrap();
    server.recv().await;

    // SEQUENCE with indefinite length
    server.send_raw(&[0x30, 0x80]).await;

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, LdapError::Decoding(_)), "got {err:?}");
    assert!(err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.metrics().snapshot().decode_errors, 1);
}

#[tokio::test]
async fn test_deeply_nested_frame_closes_connection() {
    let (conn, mut server) = default_pair();
    let pending = conn
        .begin(ProtocolOp::DelRequest("cn=x".into()), Vec::new())
        .await
        .unwrap();
    server.recv().await;

    // 5,000 nested SEQUENCEs inside an LDAPMessage
    let layers = 5_000usize;
    let mut body = vec![0x02, 0x01, 0x01];
    for i in 0..layers {
        body.extend_from_slice(&[0x30, 0x84]);
        body.extend_from_slice(&(((layers - i - 1) * 6) as u32).to_be_bytes());
    }
    let mut frame = vec![0x30, 0x84];
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    server.send_raw(&frame).await;

    match pending.wait().await {
        Err(LdapError::Decoding(e)) => assert_eq!(e.kind, DecodingErrorKind::NestingTooDeep),
        other => panic!("expected a decoding error, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.metrics().snapshot().decode_errors, 1);
}

#[tokio::test]
async fn test_server_hangup_fails_pending_requests() {
    let (conn, mut server) = default_pair();
    let pending = conn
        .begin(ProtocolOp::DelRequest("cn=x".into()), Vec::new())
        .await
        .unwrap();
    server.recv().await;
    drop(server);

    assert!(matches!(
        pending.wait().await,
        Err(LdapError::ConnectionClosed)
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_mismatched_response_type_is_reported() {
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.delete("cn=x").await }
    });
    let id = server.recv().await.message_id;
    server
        .reply(id, ProtocolOp::AddResponse(LdapResult::success()))
        .await;

    assert!(matches!(
        task.await.unwrap(),
        Err(LdapError::UnexpectedMessage(_))
    ));
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_begin_then_wait() {
    let (conn, mut server) = default_pair();
    let mut pending = conn
        .begin(ProtocolOp::DelRequest("cn=x".into()), Vec::new())
        .await
        .unwrap();
    let request = server.recv().await;
    assert_eq!(request.message_id, pending.message_id());
    assert!(pending.try_result().is_none());

    server
        .reply(request.message_id, ProtocolOp::DelResponse(LdapResult::success()))
        .await;
    let response = pending.wait().await.unwrap();
    assert_eq!(response.op, ProtocolOp::DelResponse(LdapResult::success()));
}

#[tokio::test]
async fn test_reserved_operations_rejected_by_issue() {
    let (conn, mut server) = default_pair();
    let bind = ProtocolOp::BindRequest(ldap_protocol::protocol::message::BindRequest::simple(
        "cn=x", "pw",
    ));
    assert!(matches!(
        conn.issue(bind, Vec::new()).await,
        Err(LdapError::InvalidState(_))
    ));
    assert!(matches!(
        conn.issue(ProtocolOp::UnbindRequest, Vec::new()).await,
        Err(LdapError::InvalidState(_))
    ));
    assert!(server.recv_within(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn test_simple_bind_success_and_failure() {
    let (conn, mut server) = default_pair();

    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.simple_bind("cn=admin,dc=example,dc=com", "wrong").await }
    });
    let request = server.recv().await;
    match &request.op {
        ProtocolOp::BindRequest(bind) => {
            assert_eq!(bind.version, 3);
            assert_eq!(bind.name, "cn=admin,dc=example,dc=com");
            assert_eq!(bind.authentication, BindAuthentication::Simple(b"wrong".to_vec()));
        }
        other => panic!("expected bind, got {other:?}"),
    }
    server
        .reply(
            request.message_id,
            ProtocolOp::BindResponse(BindResponse {
                result: result(ResultCode::InvalidCredentials),
                server_sasl_creds: None,
            }),
        )
        .await;
    match task.await.unwrap() {
        Err(e) => assert_eq!(e.result_code(), Some(ResultCode::InvalidCredentials)),
        Ok(r) => panic!("bind should fail, got {r:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Connected);

    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.simple_bind("cn=admin,dc=example,dc=com", "secret").await }
    });
    let id = server.recv().await.message_id;
    server.reply(id, bind_ok(None)).await;
    assert!(task.await.unwrap().is_ok());
    assert_eq!(conn.state(), ConnectionState::Bound);

    let snapshot = conn.metrics().snapshot();
    assert_eq!(snapshot.binds_total, 2);
    assert_eq!(snapshot.binds_success, 1);
    assert_eq!(snapshot.binds_failed, 1);
}

#[tokio::test]
async fn test_bind_waits_for_in_flight_search() {
    let (conn, mut server) = default_pair();
    let stream = conn.search_stream(subtree_search()).await.unwrap();
    let search_id = server.recv().await.message_id;

    let bind = tokio::spawn({
        let conn = conn.clone();
        async move { conn.simple_bind("cn=admin", "secret").await }
    });
    assert!(server.recv_within(Duration::from_millis(100)).await.is_none());

    server.send(search_done(search_id)).await;
    assert_eq!(stream.collect().await.unwrap().len(), 1);

    let request = server.recv().await;
    assert!(matches!(request.op, ProtocolOp::BindRequest(_)));
    server.reply(request.message_id, bind_ok(None)).await;
    assert!(bind.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_sasl_plain_sends_initial_response() {
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.sasl_bind(&SaslRequest::new("PLAIN", "admin", "password"))
                .await
        }
    });

    let request = server.recv().await;
    match &request.op {
        ProtocolOp::BindRequest(bind) => assert_eq!(
            bind.authentication,
            BindAuthentication::Sasl {
                mechanism: "PLAIN".into(),
                credentials: Some(b"\0admin\0password".to_vec()),
            }
        ),
        other => panic!("expected bind, got {other:?}"),
    }
    server.reply(request.message_id, bind_ok(None)).await;

    assert!(task.await.unwrap().is_ok());
    assert_eq!(conn.state(), ConnectionState::Bound);
}

#[tokio::test]
async fn test_sasl_cram_md5_challenge_round() {
    let authcid = "uid=diradmin,cn=users,dc=macds,dc=local";
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.sasl_bind(&SaslRequest::new("CRAM-MD5", authcid, "Password1!"))
                .await
        }
    });

    let first = server.recv().await;
    match &first.op {
        ProtocolOp::BindRequest(bind) => assert_eq!(
            bind.authentication,
            BindAuthentication::Sasl {
                mechanism: "CRAM-MD5".into(),
                credentials: None,
            }
        ),
        other => panic!("expected bind, got {other:?}"),
    }
    server
        .reply(
            first.message_id,
            ProtocolOp::BindResponse(BindResponse {
                result: result(ResultCode::SaslBindInProgress),
                server_sasl_creds: Some(b"<882488554.1384558462@macds.local>".to_vec()),
            }),
        )
        .await;

    let second = server.recv().await;
    assert_ne!(second.message_id, first.message_id);
    let expected = format!("{authcid} 50bd56f6c01f2ca7dec7147550b3c959");
    match &second.op {
        ProtocolOp::BindRequest(bind) => assert_eq!(
            bind.authentication,
            BindAuthentication::Sasl {
                mechanism: "CRAM-MD5".into(),
                credentials: Some(expected.into_bytes()),
            }
        ),
        other => panic!("expected bind, got {other:?}"),
    }
    server.reply(second.message_id, bind_ok(None)).await;

    assert!(task.await.unwrap().is_ok());
    assert_eq!(conn.state(), ConnectionState::Bound);
}

#[tokio::test]
async fn test_sasl_unknown_mechanism() {
    let (conn, mut server) = default_pair();
    let err = conn
        .sasl_bind(&SaslRequest::new("GSS-SPNEGO", "admin", "pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, LdapError::MechanismUnsupported(m) if m == "GSS-SPNEGO"));
    assert!(server.recv_within(Duration::from_millis(50)).await.is_none());
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_compare_maps_result_codes() {
    let (conn, mut server) = default_pair();
    for (code, expected) in [(ResultCode::CompareTrue, true), (ResultCode::CompareFalse, false)] {
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.compare("cn=a", "mail", "a@example.com").await }
        });
        let request = server.recv().await;
        match &request.op {
            ProtocolOp::CompareRequest(compare) => {
                assert_eq!(compare.attribute, "mail");
                assert_eq!(compare.value, b"a@example.com");
            }
            other => panic!("expected compare, got {other:?}"),
        }
        server
            .reply(request.message_id, ProtocolOp::CompareResponse(result(code)))
            .await;
        assert_eq!(task.await.unwrap().unwrap(), expected);
    }
}

#[tokio::test]
async fn test_who_am_i() {
    let (conn, mut server) = default_pair();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.who_am_i().await }
    });
    let request = server.recv().await;
    match &request.op {
        ProtocolOp::ExtendedRequest(ext) => assert_eq!(ext.name, oids::WHO_AM_I),
        other => panic!("expected extended request, got {other:?}"),
    }
    server
        .reply(
            request.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                name: None,
                value: Some(b"dn:cn=admin,dc=example,dc=com".to_vec()),
            }),
        )
        .await;
    assert_eq!(task.await.unwrap().unwrap(), "dn:cn=admin,dc=example,dc=com");
}

#[tokio::test]
async fn test_unbind_closes_connection() {
    let (conn, mut server) = default_pair();
    conn.unbind().await.unwrap();

    assert_eq!(server.recv().await.op, ProtocolOp::UnbindRequest);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(server.recv_within(Duration::from_millis(100)).await.is_none());

    assert!(matches!(
        conn.delete("cn=x").await,
        Err(LdapError::ConnectionClosed)
    ));
    // Second unbind is a no-op
    assert!(conn.unbind().await.is_ok());
}
