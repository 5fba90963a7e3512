//! DIGEST-MD5 (RFC 2831) with `qop=auth`.
//!
//! Round one parses the server's directive list and answers with a
//! `md5-sess` digest-response. Round two checks the server's `rspauth`
//! against the value computed locally, which authenticates the server.

use md5::{Digest, Md5};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use super::{terminal_state_error, SaslClient, SaslRequest, SaslState};
use crate::error::SaslError;

const NONCE_COUNT: &str = "00000001";
const QOP_AUTH: &str = "auth";

/// Parsed `digest-challenge`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestChallenge {
    pub realms: Vec<String>,
    pub nonce: String,
    pub qop: Vec<String>,
    pub algorithm: Option<String>,
    pub charset: Option<String>,
    pub ciphers: Vec<String>,
    pub stale: bool,
    pub maxbuf: Option<u32>,
}

impl DigestChallenge {
    pub fn parse(challenge: &[u8]) -> Result<Self, SaslError> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| SaslError::MalformedChallenge("challenge is not UTF-8".into()))?;

        let mut parsed = DigestChallenge::default();
        let mut nonce = None;
        for (key, value) in parse_directives(text)? {
            match key.to_ascii_lowercase().as_str() {
                "realm" => parsed.realms.push(value),
                "nonce" => {
                    if nonce.replace(value).is_some() {
                        return Err(SaslError::MalformedChallenge("duplicate nonce".into()));
                    }
                }
                "qop" => parsed.qop = split_list(&value),
                "algorithm" => parsed.algorithm = Some(value),
                "charset" => parsed.charset = Some(value),
                "cipher" => parsed.ciphers = split_list(&value),
                "stale" => parsed.stale = value.eq_ignore_ascii_case("true"),
                "maxbuf" => {
                    parsed.maxbuf = Some(value.parse().map_err(|_| {
                        SaslError::MalformedChallenge(format!("invalid maxbuf {value}"))
                    })?)
                }
                // Unknown directives are ignored
                _ => {}
            }
        }

        parsed.nonce = nonce.ok_or_else(|| SaslError::MalformedChallenge("missing nonce".into()))?;
        if parsed.qop.is_empty() {
            parsed.qop.push(QOP_AUTH.to_string());
        }
        Ok(parsed)
    }
}

/// `key=value` pairs, values optionally quoted with `\` escapes
fn parse_directives(text: &str) -> Result<Vec<(String, String)>, SaslError> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(out);
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => {
                    return Err(SaslError::MalformedChallenge(format!(
                        "directive '{}' has no value",
                        key.trim()
                    )))
                }
            }
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(SaslError::MalformedChallenge(
                            "unterminated quoted string".into(),
                        ))
                    }
                }
            }
        } else {
            while let Some(c) = chars.peek().copied() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        out.push((key.trim().to_string(), value));
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub struct DigestMd5Client {
    username: String,
    password: Zeroizing<Vec<u8>>,
    realm: Option<String>,
    digest_uri: String,
    cnonce: Option<String>,
    expected_rspauth: Option<String>,
    state: SaslState,
}

impl DigestMd5Client {
    pub fn new(request: &SaslRequest) -> Self {
        Self {
            username: request.authorization_id.clone(),
            password: request.credentials.clone(),
            realm: request.realm.clone(),
            digest_uri: format!("{}/{}", request.service, request.host),
            cnonce: None,
            expected_rspauth: None,
            state: SaslState::Initial,
        }
    }

    /// Use a fixed client nonce instead of a random one
    pub fn with_cnonce(mut self, cnonce: impl Into<String>) -> Self {
        self.cnonce = Some(cnonce.into());
        self
    }

    fn session_key(&self, realm: &str, nonce: &str, cnonce: &str) -> String {
        let mut secret = Zeroizing::new(Vec::new());
        secret.extend_from_slice(self.username.as_bytes());
        secret.push(b':');
        secret.extend_from_slice(realm.as_bytes());
        secret.push(b':');
        secret.extend_from_slice(&self.password);

        let mut a1 = Md5::digest(secret.as_slice()).to_vec();
        a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
        md5_hex(&a1)
    }

    fn digest(&self, ha1: &str, nonce: &str, cnonce: &str, a2: &str) -> String {
        let ha2 = md5_hex(a2.as_bytes());
        md5_hex(format!("{ha1}:{nonce}:{NONCE_COUNT}:{cnonce}:{QOP_AUTH}:{ha2}").as_bytes())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let parsed = DigestChallenge::parse(challenge)?;

        if let Some(algorithm) = &parsed.algorithm {
            if !algorithm.eq_ignore_ascii_case("md5-sess") {
                return Err(SaslError::MalformedChallenge(format!(
                    "unsupported algorithm {algorithm}"
                )));
            }
        }
        if !parsed.qop.iter().any(|q| q.eq_ignore_ascii_case(QOP_AUTH)) {
            return Err(SaslError::MalformedChallenge(format!(
                "server offers no supported qop: {}",
                parsed.qop.join(",")
            )));
        }

        let realm = self
            .realm
            .clone()
            .or_else(|| parsed.realms.first().cloned())
            .unwrap_or_default();
        let cnonce = match &self.cnonce {
            Some(c) => c.clone(),
            None => {
                let mut raw = [0u8; 16];
                rand::rng().fill_bytes(&mut raw);
                hex::encode(raw)
            }
        };

        let ha1 = self.session_key(&realm, &parsed.nonce, &cnonce);
        let response = self.digest(
            &ha1,
            &parsed.nonce,
            &cnonce,
            &format!("AUTHENTICATE:{}", self.digest_uri),
        );
        self.expected_rspauth = Some(self.digest(
            &ha1,
            &parsed.nonce,
            &cnonce,
            &format!(":{}", self.digest_uri),
        ));

        let mut fields = Vec::new();
        if parsed
            .charset
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("utf-8"))
        {
            fields.push("charset=utf-8".to_string());
        }
        fields.push(format!("username={}", quote(&self.username)));
        fields.push(format!("realm={}", quote(&realm)));
        fields.push(format!("nonce={}", quote(&parsed.nonce)));
        fields.push(format!("nc={NONCE_COUNT}"));
        fields.push(format!("cnonce={}", quote(&cnonce)));
        fields.push(format!("digest-uri={}", quote(&self.digest_uri)));
        fields.push(format!("response={response}"));
        fields.push(format!("qop={QOP_AUTH}"));
        Ok(fields.join(",").into_bytes())
    }

    fn verify(&self, challenge: &[u8]) -> Result<(), SaslError> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| SaslError::MalformedChallenge("response-auth is not UTF-8".into()))?;
        let rspauth = parse_directives(text)?
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("rspauth"))
            .map(|(_, v)| v)
            .ok_or_else(|| SaslError::MalformedChallenge("missing rspauth".into()))?;

        match &self.expected_rspauth {
            Some(expected) if expected.eq_ignore_ascii_case(&rspauth) => Ok(()),
            _ => Err(SaslError::VerificationFailed(
                "server rspauth does not match".into(),
            )),
        }
    }
}

impl SaslClient for DigestMd5Client {
    fn mechanism_name(&self) -> &str {
        "DIGEST-MD5"
    }

    fn has_initial_response(&self) -> bool {
        false
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self.state {
            SaslState::Initial => match self.respond(challenge) {
                Ok(response) => {
                    self.state = SaslState::ResponseSent { round: 1 };
                    Ok(response)
                }
                Err(e) => {
                    self.state = SaslState::Invalid;
                    Err(e)
                }
            },
            SaslState::ResponseSent { .. } => match self.verify(challenge) {
                Ok(()) => {
                    self.state = SaslState::Valid;
                    Ok(Vec::new())
                }
                Err(e) => {
                    self.state = SaslState::Invalid;
                    Err(e)
                }
            },
            terminal => Err(terminal_state_error(self.mechanism_name(), terminal)),
        }
    }

    fn state(&self) -> SaslState {
        self.state
    }

    fn dispose(&mut self) {
        self.password.zeroize();
        self.expected_rspauth = None;
        self.state = SaslState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const RFC_CHALLENGE: &[u8] = b"realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",algorithm=md5-sess,charset=utf-8";

    fn rfc_client() -> DigestMd5Client {
        let request = SaslRequest::new("DIGEST-MD5", "chris", "secret")
            .with_service("imap")
            .with_host("elwood.innosoft.com");
        DigestMd5Client::new(&request).with_cnonce("OA6MHXh6VqTrRk")
    }

    #[test]
    fn test_parse_challenge_directives() {
        let parsed = DigestChallenge::parse(
            b"realm=\"a\", realm=\"b\",nonce=\"n\\\"x\",qop=\"auth,auth-int\",cipher=\"rc4,3des\",stale=true,maxbuf=65536,algorithm=md5-sess,token=ignored",
        )
        .unwrap();
        assert_eq!(parsed.realms, vec!["a", "b"]);
        assert_eq!(parsed.nonce, "n\"x");
        assert_eq!(parsed.qop, vec!["auth", "auth-int"]);
        assert_eq!(parsed.ciphers, vec!["rc4", "3des"]);
        assert!(parsed.stale);
        assert_eq!(parsed.maxbuf, Some(65536));
        assert_eq!(parsed.algorithm.as_deref(), Some("md5-sess"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(DigestChallenge::parse(b"realm=\"x\"").is_err());
        assert!(DigestChallenge::parse(b"nonce=\"abc").is_err());
        assert!(DigestChallenge::parse(b"nonce").is_err());
        assert!(DigestChallenge::parse(b"nonce=a,nonce=b").is_err());
        assert!(DigestChallenge::parse(b"nonce=a,maxbuf=big").is_err());
    }

    #[test]
    fn test_rfc2831_exchange() {
        let mut c = rfc_client();
        assert!(!c.has_initial_response());

        let response = String::from_utf8(c.evaluate_challenge(RFC_CHALLENGE).unwrap()).unwrap();
        assert_eq!(
            response,
            "charset=utf-8,username=\"chris\",realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",nc=00000001,cnonce=\"OA6MHXh6VqTrRk\",digest-uri=\"imap/elwood.innosoft.com\",response=d388dad90d4bbd760a152321f2143af7,qop=auth"
        );
        assert_eq!(c.state(), SaslState::ResponseSent { round: 1 });

        let done = c
            .evaluate_challenge(b"rspauth=ea40f60335c427b5527b84dbabcdfffd")
            .unwrap();
        assert!(done.is_empty());
        assert!(c.is_complete());
        assert!(c.evaluate_challenge(&[]).is_err());
    }

    #[test]
    fn test_bad_rspauth_fails_verification() {
        let mut c = rfc_client();
        c.evaluate_challenge(RFC_CHALLENGE).unwrap();
        assert!(matches!(
            c.evaluate_challenge(b"rspauth=00000000000000000000000000000000"),
            Err(SaslError::VerificationFailed(_))
        ));
        assert_eq!(c.state(), SaslState::Invalid);
    }

    #[test]
    fn test_unsupported_qop_or_algorithm() {
        let mut c = rfc_client();
        assert!(c.evaluate_challenge(b"nonce=\"x\",qop=\"auth-conf\"").is_err());
        assert_eq!(c.state(), SaslState::Invalid);

        let mut c = rfc_client();
        assert!(c.evaluate_challenge(b"nonce=\"x\",algorithm=md5").is_err());
    }

    #[test]
    fn test_random_cnonce_is_used_without_override() {
        let request = SaslRequest::new("DIGEST-MD5", "u", "p");
        let mut c = DigestMd5Client::new(&request);
        let response = String::from_utf8(c.evaluate_challenge(b"nonce=\"abc\"").unwrap()).unwrap();
        assert!(response.contains("cnonce=\""));
        assert!(response.contains("digest-uri=\"ldap/localhost\""));
        assert!(response.contains("realm=\"\""));
    }
}
