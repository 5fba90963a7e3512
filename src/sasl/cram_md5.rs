//! CRAM-MD5 (RFC 2195): keyed MD5 over the server's nonce.

use hmac::{Hmac, Mac};
use md5::Md5;
use zeroize::{Zeroize, Zeroizing};

use super::{terminal_state_error, SaslClient, SaslRequest, SaslState};
use crate::error::SaslError;

type HmacMd5 = Hmac<Md5>;

pub struct CramMd5Client {
    username: String,
    password: Zeroizing<Vec<u8>>,
    state: SaslState,
}

impl CramMd5Client {
    pub fn new(request: &SaslRequest) -> Self {
        Self {
            username: request.authorization_id.clone(),
            password: request.credentials.clone(),
            state: SaslState::Initial,
        }
    }

    /// `"<username> <hex HMAC-MD5(password, nonce)>"`
    fn respond(&self, nonce: &[u8]) -> Result<Vec<u8>, SaslError> {
        let mut mac = HmacMd5::new_from_slice(&self.password)
            .map_err(|e| SaslError::MalformedChallenge(format!("HMAC key rejected: {e}")))?;
        mac.update(nonce);
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{} {}", self.username, digest).into_bytes())
    }
}

impl SaslClient for CramMd5Client {
    fn mechanism_name(&self) -> &str {
        "CRAM-MD5"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self.state {
            SaslState::Initial if challenge.is_empty() => {
                self.state = SaslState::Invalid;
                Err(SaslError::MalformedChallenge(
                    "CRAM-MD5 requires a non-empty server nonce".into(),
                ))
            }
            SaslState::Initial => {
                let response = self.respond(challenge)?;
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
                    "CRAM-MD5 expects an empty confirmation, got {} bytes",
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

    #[test]
    fn test_rfc2195_vector() {
        let mut c = CramMd5Client::new(&SaslRequest::new("CRAM-MD5", "tim", "tanstaaftanstaaf"));
        let response = c
            .evaluate_challenge(b"<1896.697170952@postoffice.reston.mci.net>")
            .unwrap();
        assert_eq!(response, b"tim b913a602c7eda7a495b4e6e7334d3890".to_vec());
    }

    #[test]
    fn test_directory_admin_vector_and_lifecycle() {
        let mut c = CramMd5Client::new(&SaslRequest::new(
            "CRAM-MD5",
            "uid=diradmin,cn=users,dc=macds,dc=local",
            "Password1!",
        ));
        assert!(!c.has_initial_response());

        let response = c
            .evaluate_challenge(b"<882488554.1384558462@macds.local>")
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "uid=diradmin,cn=users,dc=macds,dc=local 50bd56f6c01f2ca7dec7147550b3c959"
        );

        assert!(c.evaluate_challenge(&[]).unwrap().is_empty());
        assert_eq!(c.state(), SaslState::Valid);
        assert!(matches!(
            c.evaluate_challenge(&[]),
            Err(SaslError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_non_empty_confirmation_is_invalid() {
        let mut c = CramMd5Client::new(&SaslRequest::new("CRAM-MD5", "tim", "pw"));
        c.evaluate_challenge(b"<1@host>").unwrap();
        assert!(c.evaluate_challenge(b"unexpected").is_err());
        assert_eq!(c.state(), SaslState::Invalid);
    }

    #[test]
    fn test_empty_nonce_rejected() {
        let mut c = CramMd5Client::new(&SaslRequest::new("CRAM-MD5", "tim", "pw"));
        assert!(matches!(
            c.evaluate_challenge(&[]),
            Err(SaslError::MalformedChallenge(_))
        ));
        assert_eq!(c.state(), SaslState::Invalid);
    }
}
