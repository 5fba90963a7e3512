//! # Transport Layer
//!
//! Byte streams under an LDAP connection.
//!
//! ## Components
//! - **Stream**: plain TCP, TLS, or a caller-supplied stream behind one type
//! - **TLS**: rustls client configuration and handshake (LDAPS and StartTLS)

pub mod stream;
pub mod tls;

pub use stream::{AsyncIo, LdapStream};
pub use tls::TlsClientConfig;
