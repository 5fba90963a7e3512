//! # SASL Authentication
//!
//! Pluggable challenge/response mechanisms for LDAP SASL binds (RFC 4513).
//!
//! ## Components
//! - [`SaslClient`]: one authentication exchange for one mechanism
//! - [`SaslRequest`]: the identity and credentials a mechanism is built from
//! - [`SaslRegistry`]: mechanism name to factory, owned by a connection
//!
//! ## State Machine
//! ```text
//! Initial -> ResponseSent -> Valid | Invalid
//!    \            \               \
//!     +------------+---------------+--> Disposed
//! ```
//! `Valid`, `Invalid` and `Disposed` are terminal. Evaluating a challenge in a
//! terminal state is an error.
//!
//! ## Example
//! ```rust
//! use ldap_protocol::sasl::{SaslRegistry, SaslRequest};
//!
//! let registry = SaslRegistry::new();
//! let request = SaslRequest::new("PLAIN", "admin", "password");
//! let mut client = registry.create(&request).unwrap();
//! assert!(client.has_initial_response());
//! assert_eq!(client.evaluate_challenge(&[]).unwrap(), b"\0admin\0password");
//! ```

pub mod cram_md5;
pub mod digest_md5;
pub mod external;
pub mod plain;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::info;
use zeroize::Zeroizing;

use crate::error::{constants, LdapError, Result, SaslError};

pub use cram_md5::CramMd5Client;
pub use digest_md5::DigestMd5Client;
pub use external::ExternalClient;
pub use plain::PlainClient;

/// Lifecycle of a mechanism client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    Initial,
    /// At least one response has been produced; `round` counts them
    ResponseSent { round: u8 },
    Valid,
    Invalid,
    Disposed,
}

impl SaslState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SaslState::Valid | SaslState::Invalid | SaslState::Disposed)
    }
}

impl fmt::Display for SaslState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslState::Initial => f.write_str("Initial"),
            SaslState::ResponseSent { round } => write!(f, "ResponseSent({round})"),
            SaslState::Valid => f.write_str("Valid"),
            SaslState::Invalid => f.write_str("Invalid"),
            SaslState::Disposed => f.write_str("Disposed"),
        }
    }
}

/// One SASL authentication exchange.
pub trait SaslClient: Send {
    fn mechanism_name(&self) -> &str;

    /// Whether the first bind carries a response before any server challenge
    fn has_initial_response(&self) -> bool;

    /// Produce the response to `challenge`. The initial response is produced
    /// by evaluating an empty challenge.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> std::result::Result<Vec<u8>, SaslError>;

    fn state(&self) -> SaslState;

    fn is_complete(&self) -> bool {
        self.state() == SaslState::Valid
    }

    /// Release credentials; terminal from any state
    fn dispose(&mut self);
}

/// Error for a challenge evaluated after the exchange ended
pub(crate) fn terminal_state_error(mechanism: &str, state: SaslState) -> SaslError {
    SaslError::InvalidState {
        mechanism: mechanism.to_string(),
        state: state.to_string(),
    }
}

/// Everything a mechanism needs to authenticate
#[derive(Clone)]
pub struct SaslRequest {
    pub mechanism: String,
    /// Identity to authenticate as (authcid for PLAIN/CRAM/DIGEST, authzid for EXTERNAL)
    pub authorization_id: String,
    pub credentials: Zeroizing<Vec<u8>>,
    pub realm: Option<String>,
    pub qop: Option<String>,
    pub constraints: HashMap<String, String>,
    /// Service name for digest-uri
    pub service: String,
    /// Host name for digest-uri
    pub host: String,
}

impl fmt::Debug for SaslRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslRequest")
            .field("mechanism", &self.mechanism)
            .field("authorization_id", &self.authorization_id)
            .field("credentials", &"<redacted>")
            .field("realm", &self.realm)
            .field("qop", &self.qop)
            .field("constraints", &self.constraints)
            .field("service", &self.service)
            .field("host", &self.host)
            .finish()
    }
}

impl SaslRequest {
    pub fn new(
        mechanism: impl Into<String>,
        authorization_id: impl Into<String>,
        credentials: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            mechanism: mechanism.into(),
            authorization_id: authorization_id.into(),
            credentials: Zeroizing::new(credentials.into()),
            realm: None,
            qop: None,
            constraints: HashMap::new(),
            service: "ldap".to_string(),
            host: "localhost".to_string(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_qop(mut self, qop: impl Into<String>) -> Self {
        self.qop = Some(qop.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }
}

type FactoryFn = dyn Fn(&SaslRequest) -> Box<dyn SaslClient> + Send + Sync + 'static;

/// Mechanism name to client factory.
///
/// Names are matched case-insensitively. Custom factories take precedence
/// over the built-in mechanisms of the same name.
#[derive(Clone)]
pub struct SaslRegistry {
    custom: Arc<RwLock<HashMap<String, Arc<FactoryFn>>>>,
}

impl Default for SaslRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SaslRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslRegistry")
            .field("mechanisms", &self.mechanisms())
            .finish()
    }
}

const BUILTIN_MECHANISMS: [&str; 4] = ["CRAM-MD5", "DIGEST-MD5", "EXTERNAL", "PLAIN"];

impl SaslRegistry {
    pub fn new() -> Self {
        Self {
            custom: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a factory, overriding any mechanism of the same name
    pub fn register<F>(&self, mechanism: &str, factory: F) -> Result<()>
    where
        F: Fn(&SaslRequest) -> Box<dyn SaslClient> + Send + Sync + 'static,
    {
        let name = mechanism.to_ascii_uppercase();
        let mut custom = self
            .custom
            .write()
            .map_err(|_| LdapError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if BUILTIN_MECHANISMS.contains(&name.as_str()) {
            info!(mechanism = %name, "Custom SASL factory overrides built-in mechanism");
        }
        custom.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Build a client for `request.mechanism`; `None` if no mechanism matches
    pub fn create(&self, request: &SaslRequest) -> Option<Box<dyn SaslClient>> {
        let name = request.mechanism.to_ascii_uppercase();

        let factory = self
            .custom
            .read()
            .ok()
            .and_then(|custom| custom.get(&name).cloned());
        if let Some(factory) = factory {
            return Some(factory(request));
        }

        let client: Box<dyn SaslClient> = match name.as_str() {
            "PLAIN" => Box::new(PlainClient::new(request)),
            "CRAM-MD5" => Box::new(CramMd5Client::new(request)),
            "EXTERNAL" => Box::new(ExternalClient::new(request)),
            "DIGEST-MD5" => Box::new(DigestMd5Client::new(request)),
            _ => return None,
        };
        Some(client)
    }

    pub fn supports(&self, mechanism: &str) -> bool {
        let name = mechanism.to_ascii_uppercase();
        BUILTIN_MECHANISMS.contains(&name.as_str())
            || self
                .custom
                .read()
                .map(|c| c.contains_key(&name))
                .unwrap_or(false)
    }

    /// All mechanism names, sorted
    pub fn mechanisms(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_MECHANISMS.iter().map(|m| m.to_string()).collect();
        if let Ok(custom) = self.custom.read() {
            names.extend(custom.keys().cloned());
        }
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct Canned(SaslState);

    impl SaslClient for Canned {
        fn mechanism_name(&self) -> &str {
            "PLAIN"
        }
        fn has_initial_response(&self) -> bool {
            false
        }
        fn evaluate_challenge(&mut self, _: &[u8]) -> std::result::Result<Vec<u8>, SaslError> {
            self.0 = SaslState::Valid;
            Ok(b"canned".to_vec())
        }
        fn state(&self) -> SaslState {
            self.0
        }
        fn dispose(&mut self) {
            self.0 = SaslState::Disposed;
        }
    }

    #[test]
    fn test_builtins_resolve_case_insensitively() {
        let registry = SaslRegistry::new();
        for name in ["plain", "Cram-Md5", "EXTERNAL", "digest-md5"] {
            let client = registry.create(&SaslRequest::new(name, "u", "p")).unwrap();
            assert_eq!(client.mechanism_name(), name.to_ascii_uppercase());
            assert_eq!(client.state(), SaslState::Initial);
        }
    }

    #[test]
    fn test_unknown_mechanism_is_absent() {
        let registry = SaslRegistry::new();
        assert!(registry.create(&SaslRequest::new("GSSAPI", "u", "p")).is_none());
        assert!(!registry.supports("GSSAPI"));
    }

    #[test]
    fn test_custom_factory_overrides_builtin() {
        let registry = SaslRegistry::new();
        registry
            .register("plain", |_| Box::new(Canned(SaslState::Initial)))
            .unwrap();

        let mut client = registry.create(&SaslRequest::new("PLAIN", "u", "p")).unwrap();
        assert!(!client.has_initial_response());
        assert_eq!(client.evaluate_challenge(&[]).unwrap(), b"canned");
        assert!(client.is_complete());
        assert_eq!(registry.mechanisms().iter().filter(|m| *m == "PLAIN").count(), 1);
    }

    #[test]
    fn test_custom_mechanism_registration() {
        let registry = SaslRegistry::new();
        registry
            .register("X-TOKEN", |_| Box::new(Canned(SaslState::Initial)))
            .unwrap();
        assert!(registry.supports("x-token"));
        assert!(registry.mechanisms().contains(&"X-TOKEN".to_string()));
    }

    #[test]
    fn test_request_debug_redacts_credentials() {
        let request = SaslRequest::new("PLAIN", "admin", "hunter2");
        let printed = format!("{request:?}");
        assert!(!printed.contains("hunter2"));
        assert_eq!(request.service, "ldap");
    }

    #[test]
    fn test_terminal_states() {
        assert!(SaslState::Valid.is_terminal());
        assert!(SaslState::Invalid.is_terminal());
        assert!(SaslState::Disposed.is_terminal());
        assert!(!SaslState::ResponseSent { round: 1 }.is_terminal());
        assert_eq!(SaslState::ResponseSent { round: 2 }.to_string(), "ResponseSent(2)");
    }
}
