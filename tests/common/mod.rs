//! Scripted in-memory directory server shared by the integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ldap_protocol::config::ClientConfig;
use ldap_protocol::core::codec::LdapCodec;
use ldap_protocol::protocol::message::{
    LdapMessage, LdapResult, ProtocolOp, ResultCode, SearchResultEntry,
};
use ldap_protocol::service::Connection;
use ldap_protocol::transport::LdapStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

pub struct FakeServer<S = DuplexStream> {
    framed: Framed<S, LdapCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FakeServer<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LdapCodec::default()),
        }
    }

    /// Next request from the client; panics after five seconds
    pub async fn recv(&mut self) -> LdapMessage {
        tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the stream")
            .expect("client sent an undecodable frame")
    }

    /// Next request if one arrives within `wait`
    pub async fn recv_within(&mut self, wait: Duration) -> Option<LdapMessage> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    pub async fn send(&mut self, msg: LdapMessage) {
        self.framed.send(msg).await.unwrap();
    }

    pub async fn reply(&mut self, message_id: i32, op: ProtocolOp) {
        self.send(LdapMessage::new(message_id, op)).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// The underlying stream; panics if unread bytes are buffered
    pub fn into_stream(self) -> S {
        let parts = self.framed.into_parts();
        assert!(parts.read_buf.is_empty(), "unread bytes in server buffer");
        parts.io
    }
}

pub fn connect_pair(config: ClientConfig) -> (Connection, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::from_stream(LdapStream::custom(client), config).unwrap();
    (conn, FakeServer::new(server))
}

pub fn default_pair() -> (Connection, FakeServer) {
    connect_pair(ClientConfig::default())
}

pub fn entry(message_id: i32, dn: &str) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            dn: dn.to_string(),
            attributes: vec![],
        }),
    )
}

pub fn search_done(message_id: i32) -> LdapMessage {
    LdapMessage::new(message_id, ProtocolOp::SearchResultDone(LdapResult::success()))
}

pub fn result(code: ResultCode) -> LdapResult {
    LdapResult::new(code)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
