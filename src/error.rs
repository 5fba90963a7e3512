//! # Error Types
//!
//! Error handling for the LDAP protocol core.
//!
//! This module defines every error variant that can surface from the codec,
//! the dispatch engine, the transport and the SASL framework.
//!
//! ## Error Categories
//! - **Codec Errors**: malformed BER; fatal to the connection because frame
//!   boundaries can no longer be trusted
//! - **Transport Errors**: socket failures, TLS failures, closed streams
//! - **Protocol Errors**: non-success LDAP result codes; the connection stays usable
//! - **SASL Errors**: illegal mechanism state transitions and unverifiable challenges
//! - **Local Contract Errors**: timeouts and abandons
//!
//! ## Example Usage
//! ```rust
//! use ldap_protocol::error::{LdapError, Result};
//! use ldap_protocol::protocol::message::ResultCode;
//!
//! fn check(code: i32) -> Result<()> {
//!     match ResultCode::from(code) {
//!         ResultCode::Success => Ok(()),
//!         other => Err(LdapError::Result {
//!             code: other,
//!             matched_dn: String::new(),
//!             message: "rejected".into(),
//!         }),
//!     }
//! }
//!
//! assert!(check(0).is_ok());
//! assert!(!check(49).unwrap_err().is_fatal());
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

use crate::protocol::message::ResultCode;

/// Static error messages for the dispatch and registry paths.
pub mod constants {
    /// Pending table / registry lock errors
    pub const ERR_PENDING_LOCK: &str = "Failed to acquire lock on pending request table";
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on registry";
    pub const ERR_STATE_LOCK: &str = "Failed to acquire lock on connection state";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOTICE_OF_DISCONNECTION: &str = "Server sent notice of disconnection";
    pub const ERR_WRITER_UNAVAILABLE: &str = "Connection writer is not available";
    pub const ERR_READER_UNAVAILABLE: &str = "Connection reader is not available";

    /// TLS errors
    pub const ERR_TLS_ALREADY_ACTIVE: &str = "TLS is already active on this connection";
}

/// Category of a BER decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The buffer ends before the declared content
    Truncated,
    /// High-tag-number continuation octets run off the end of the buffer
    MalformedTag,
    /// Tag number does not fit in 32 bits
    TagOverflow,
    /// Indefinite-length form (0x80) is not supported
    IndefiniteLength,
    /// Length octets describe a length that cannot be represented
    LengthOverflow,
    /// BOOLEAN content is not exactly one octet
    InvalidBoolean,
    /// NULL content is not empty
    InvalidNull,
    /// INTEGER/ENUMERATED content is empty
    InvalidInteger,
    /// INTEGER/ENUMERATED content does not fit in 64 bits
    IntegerOverflow,
    /// A different identifier was expected at this position
    UnexpectedTag,
    /// Bytes remain after a value that should have consumed the whole buffer
    TrailingData,
    /// OCTET STRING expected to carry UTF-8 text does not
    InvalidUtf8,
    /// Constructed values nest deeper than the decoder allows
    NestingTooDeep,
    /// Structurally invalid content
    Malformed(String),
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::Truncated => write!(f, "length overruns buffer"),
            DecodingErrorKind::MalformedTag => write!(f, "malformed tag continuation"),
            DecodingErrorKind::TagOverflow => write!(f, "tag number overflow"),
            DecodingErrorKind::IndefiniteLength => write!(f, "indefinite length not supported"),
            DecodingErrorKind::LengthOverflow => write!(f, "length overflow"),
            DecodingErrorKind::InvalidBoolean => write!(f, "invalid BOOLEAN content"),
            DecodingErrorKind::InvalidNull => write!(f, "invalid NULL content"),
            DecodingErrorKind::InvalidInteger => write!(f, "empty INTEGER content"),
            DecodingErrorKind::IntegerOverflow => write!(f, "INTEGER too large"),
            DecodingErrorKind::UnexpectedTag => write!(f, "unexpected tag"),
            DecodingErrorKind::TrailingData => write!(f, "trailing data"),
            DecodingErrorKind::InvalidUtf8 => write!(f, "invalid UTF-8"),
            DecodingErrorKind::NestingTooDeep => write!(f, "nesting too deep"),
            DecodingErrorKind::Malformed(reason) => write!(f, "{reason}"),
        }
    }
}

/// A BER decoding failure at a given byte offset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("BER decoding failed at offset {offset}: {kind}")]
pub struct DecodingError {
    pub offset: usize,
    pub kind: DecodingErrorKind,
}

impl DecodingError {
    pub fn new(offset: usize, kind: DecodingErrorKind) -> Self {
        Self { offset, kind }
    }

    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::new(offset, DecodingErrorKind::Malformed(reason.into()))
    }
}

/// Authentication failures raised by SASL mechanism clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    #[error("{mechanism}: challenge evaluated in terminal state {state}")]
    InvalidState { mechanism: String, state: String },

    #[error("Malformed challenge: {0}")]
    MalformedChallenge(String),

    #[error("Server verification failed: {0}")]
    VerificationFailed(String),

    #[error("Unexpected challenge: {0}")]
    UnexpectedChallenge(String),
}

// LdapError is the primary error type for all client operations
#[derive(Error, Debug)]
pub enum LdapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decoding(#[from] DecodingError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("{}", constants::ERR_CONNECTION_CLOSED)]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation {0} was abandoned")]
    Abandoned(i32),

    #[error("LDAP result {code}: {message}")]
    Result {
        code: ResultCode,
        matched_dn: String,
        message: String,
    },

    #[error("SASL authentication failed: {0}")]
    Sasl(#[from] SaslError),

    #[error("SASL mechanism not supported: {0}")]
    MechanismUnsupported(String),

    #[error("Message too large: {0} bytes")]
    OversizedMessage(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("No free message ID available")]
    MessageIdExhausted,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl LdapError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Codec errors desynchronize frame boundaries and transport errors lose the
    /// stream; both close the connection. Result codes, SASL failures and local
    /// timeouts do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::Io(_)
                | LdapError::Decoding(_)
                | LdapError::ConnectionClosed
                | LdapError::TransportError(_)
                | LdapError::OversizedMessage(_)
                | LdapError::TlsError(_)
        )
    }

    /// The LDAP result code carried by a protocol error, if any.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            LdapError::Result { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Type alias for Results using LdapError
pub type Result<T> = std::result::Result<T, LdapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_message() {
        assert_eq!(
            LdapError::ConnectionClosed.to_string(),
            constants::ERR_CONNECTION_CLOSED
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(LdapError::ConnectionClosed.is_fatal());
        assert!(LdapError::Decoding(DecodingError::new(0, DecodingErrorKind::NestingTooDeep)).is_fatal());
        assert!(LdapError::TlsError("handshake failed".into()).is_fatal());

        assert!(!LdapError::InvalidState(constants::ERR_TLS_ALREADY_ACTIVE.into()).is_fatal());
        assert!(!LdapError::Timeout.is_fatal());
        assert!(!LdapError::Abandoned(3).is_fatal());
    }

    #[test]
    fn test_nesting_kind_display() {
        let err = DecodingError::new(384, DecodingErrorKind::NestingTooDeep);
        assert_eq!(err.to_string(), "BER decoding failed at offset 384: nesting too deep");
    }
}
