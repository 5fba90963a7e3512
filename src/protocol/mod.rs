//! # LDAP Protocol Layer
//!
//! The RFC 4511 message model on top of the BER codec, plus request/response
//! correlation.
//!
//! ## Components
//! - **Message**: `LDAPMessage` envelope and every protocol operation
//! - **Filter**: search filter sum type
//! - **Controls**: request controls and the OID to decoder registry
//! - **Dispatcher**: message-ID allocation, pending table, unsolicited fan-out

pub(crate) mod components;
pub mod controls;
pub mod dispatcher;
pub mod filter;
pub mod message;

pub use controls::{ControlRegistry, RequestControl};
pub use dispatcher::{Dispatcher, Routed};
pub use filter::Filter;
pub use message::{Control, LdapMessage, LdapResult, ProtocolOp, ResultCode};
