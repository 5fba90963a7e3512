use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{constants, LdapError, Result};
use crate::transport::tls::TlsClientConfig;

/// Any byte stream a connection can run over
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// The byte stream under one LDAP connection.
///
/// `Tls` wraps another `LdapStream`, so StartTLS can upgrade a TCP stream or
/// any caller-supplied stream in place.
pub enum LdapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<LdapStream>>),
    Custom(Box<dyn AsyncIo>),
}

impl std::fmt::Debug for LdapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LdapStream::Plain(s) => f.debug_tuple("Plain").field(&s.peer_addr().ok()).finish(),
            LdapStream::Tls(_) => f.write_str("Tls"),
            LdapStream::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl LdapStream {
    pub fn custom<S: AsyncIo + 'static>(stream: S) -> Self {
        LdapStream::Custom(Box::new(stream))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, LdapStream::Tls(_))
    }

    /// Run a client TLS handshake over this stream
    pub async fn upgrade(self, config: &TlsClientConfig) -> Result<LdapStream> {
        if self.is_tls() {
            return Err(LdapError::InvalidState(constants::ERR_TLS_ALREADY_ACTIVE.into()));
        }
        let tls = config.handshake(self).await?;
        Ok(LdapStream::Tls(Box::new(tls)))
    }
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            LdapStream::Custom(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            LdapStream::Custom(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            LdapStream::Custom(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            LdapStream::Custom(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_custom_stream_passthrough() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = LdapStream::custom(client);
        assert!(!stream.is_tls());

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
