//! # ldap-protocol
//!
//! LDAP client protocol core: a BER codec, message-ID dispatch of many
//! concurrent operations over one stream, and pluggable SASL authentication.
//!
//! ## Layout
//! - [`core`]: ASN.1 BER values and the Tokio framing codec
//! - [`protocol`]: `LDAPMessage` envelope, filters, controls, dispatcher
//! - [`transport`]: TCP, TLS and caller-supplied streams
//! - [`service`]: [`Connection`], response streams, event poller
//! - [`sasl`]: PLAIN, CRAM-MD5, DIGEST-MD5 and EXTERNAL mechanisms
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Example
//! ```rust,no_run
//! use ldap_protocol::config::LdapConfig;
//! use ldap_protocol::protocol::message::{SearchRequest, SearchScope};
//! use ldap_protocol::protocol::Filter;
//! use ldap_protocol::service::Connection;
//!
//! # async fn run() -> ldap_protocol::error::Result<()> {
//! let config = LdapConfig::from_file("ldap.toml")?;
//! let conn = Connection::connect(&config).await?;
//! conn.simple_bind("cn=admin,dc=example,dc=com", "secret").await?;
//!
//! let found = conn
//!     .search(SearchRequest::new(
//!         "dc=example,dc=com",
//!         SearchScope::WholeSubtree,
//!         Filter::equality("uid", "jdoe"),
//!     ))
//!     .await?;
//! for entry in &found.entries {
//!     println!("{}", entry.dn);
//! }
//! conn.unbind().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod sasl;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::LdapConfig;
pub use error::{LdapError, Result};
pub use service::Connection;
