//! EXTERNAL (RFC 4422 Appendix A): identity established outside SASL, e.g. a
//! TLS client certificate.

use super::{terminal_state_error, SaslClient, SaslRequest, SaslState};
use crate::error::SaslError;

pub struct ExternalClient {
    authorization_id: String,
    state: SaslState,
}

impl ExternalClient {
    pub fn new(request: &SaslRequest) -> Self {
        Self {
            authorization_id: request.authorization_id.clone(),
            state: SaslState::Initial,
        }
    }
}

impl SaslClient for ExternalClient {
    fn mechanism_name(&self) -> &str {
        "EXTERNAL"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        if self.state.is_terminal() {
            return Err(terminal_state_error(self.mechanism_name(), self.state));
        }
        if !challenge.is_empty() {
            self.state = SaslState::Invalid;
            return Err(SaslError::UnexpectedChallenge(format!(
                "EXTERNAL expects an empty challenge, got {} bytes",
                challenge.len()
            )));
        }
        self.state = SaslState::Valid;
        // An empty authzid lets the server derive the identity from the transport
        Ok(self.authorization_id.as_bytes().to_vec())
    }

    fn state(&self) -> SaslState {
        self.state
    }

    fn dispose(&mut self) {
        self.state = SaslState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_empty_challenge_is_valid() {
        let mut c = ExternalClient::new(&SaslRequest::new("EXTERNAL", "", Vec::new()));
        assert!(!c.has_initial_response());
        assert!(c.evaluate_challenge(&[]).unwrap().is_empty());
        assert!(c.is_complete());
        assert!(c.evaluate_challenge(&[]).is_err());
    }

    #[test]
    fn test_authzid_is_sent_when_given() {
        let mut c = ExternalClient::new(&SaslRequest::new("EXTERNAL", "dn:cn=svc", Vec::new()));
        assert_eq!(c.evaluate_challenge(&[]).unwrap(), b"dn:cn=svc".to_vec());
    }

    #[test]
    fn test_non_empty_challenge_is_invalid() {
        let mut c = ExternalClient::new(&SaslRequest::new("EXTERNAL", "", Vec::new()));
        assert!(matches!(
            c.evaluate_challenge(b"x"),
            Err(SaslError::UnexpectedChallenge(_))
        ));
        assert_eq!(c.state(), SaslState::Invalid);
    }
}
