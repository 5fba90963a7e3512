//! PLAIN (RFC 4616): one response carrying the identity and password.

use zeroize::{Zeroize, Zeroizing};

use super::{terminal_state_error, SaslClient, SaslRequest, SaslState};
use crate::error::SaslError;

pub struct PlainClient {
    authorization_id: String,
    password: Zeroizing<Vec<u8>>,
    state: SaslState,
}

impl PlainClient {
    pub fn new(request: &SaslRequest) -> Self {
        Self {
            authorization_id: request.authorization_id.clone(),
            password: request.credentials.clone(),
            state: SaslState::Initial,
        }
    }
}

impl SaslClient for PlainClient {
    fn mechanism_name(&self) -> &str {
        "PLAIN"
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self.state {
            SaslState::Initial => {
                let mut response =
                    Vec::with_capacity(self.authorization_id.len() + self.password.len() + 2);
                response.push(0);
                response.extend_from_slice(self.authorization_id.as_bytes());
                response.push(0);
                response.extend_from_slice(&self.password);
                self.state = SaslState::ResponseSent { round: 1 };
                Ok(response)
            }
            SaslState::ResponseSent { .. } if challenge.is_empty() => {
                self.state = SaslState::Valid;
                Ok(Vec::new())
            }
            SaslState::ResponseSent { .. } => {
                self.state = SaslState::Invalid;
                Err(SaslError::UnexpectedChallenge(format!(
                    "PLAIN expects no further challenge, got {} bytes",
                    challenge.len()
                )))
            }
            terminal => Err(terminal_state_error(self.mechanism_name(), terminal)),
        }
    }

    fn state(&self) -> SaslState {
        self.state
    }

    fn dispose(&mut self) {
        self.password.zeroize();
        self.state = SaslState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn client() -> PlainClient {
        PlainClient::new(&SaslRequest::new("PLAIN", "admin", "password"))
    }

    #[test]
    fn test_plain_response_bytes() {
        let mut c = client();
        assert!(c.has_initial_response());
        let response = c.evaluate_challenge(&[]).unwrap();
        assert_eq!(response, b"\x00admin\x00password".to_vec());
        assert_eq!(c.state(), SaslState::ResponseSent { round: 1 });
    }

    #[test]
    fn test_empty_confirmation_completes() {
        let mut c = client();
        c.evaluate_challenge(&[]).unwrap();
        assert!(c.evaluate_challenge(&[]).unwrap().is_empty());
        assert!(c.is_complete());

        assert!(matches!(
            c.evaluate_challenge(&[]),
            Err(SaslError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_unexpected_challenge_invalidates() {
        let mut c = client();
        c.evaluate_challenge(&[]).unwrap();
        assert!(matches!(
            c.evaluate_challenge(b"more"),
            Err(SaslError::UnexpectedChallenge(_))
        ));
        assert_eq!(c.state(), SaslState::Invalid);
        assert!(c.evaluate_challenge(&[]).is_err());
    }

    #[test]
    fn test_dispose_is_terminal() {
        let mut c = client();
        c.dispose();
        assert_eq!(c.state(), SaslState::Disposed);
        assert!(c.evaluate_challenge(&[]).is_err());
    }
}
