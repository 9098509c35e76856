//! HTTP Basic authentication for proxy requests.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};

use crate::config::CredentialConfig;

/// One accepted username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl From<CredentialConfig> for Credential {
    fn from(c: CredentialConfig) -> Self {
        Credential {
            username: c.username,
            password: c.password,
        }
    }
}

/// Authentication failures. All of them produce the same 407 challenge;
/// the variants exist for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingCredentials,
    UnsupportedScheme,
    MalformedCredentials,
    BadCredentials,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingCredentials => write!(f, "no Proxy-Authorization header"),
            AuthError::UnsupportedScheme => write!(f, "unsupported authorization scheme"),
            AuthError::MalformedCredentials => write!(f, "malformed Basic credentials"),
            AuthError::BadCredentials => write!(f, "credentials did not match"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Immutable credential set checked against `Proxy-Authorization` values.
pub struct AuthGate {
    credentials: Vec<Credential>,
}

impl AuthGate {
    pub fn new(credentials: Vec<Credential>) -> Self {
        AuthGate { credentials }
    }

    /// Check a `Proxy-Authorization` header value. Returns the matched
    /// username. Logging is the only side effect; there is no lockout.
    pub fn authenticate(&self, header: Option<&str>) -> Result<&str, AuthError> {
        let result = self.check(header);
        match &result {
            Ok(user) => info!("auth accepted for {:?}", user),
            Err(e) => warn!("auth rejected: {}", e),
        }
        result
    }

    fn check(&self, header: Option<&str>) -> Result<&str, AuthError> {
        let value = header.ok_or(AuthError::MissingCredentials)?;
        let value = value.trim();

        let (scheme, payload) = value
            .split_once(' ')
            .ok_or(AuthError::UnsupportedScheme)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::UnsupportedScheme);
        }

        let decoded = BASE64
            .decode(payload.trim())
            .map_err(|_| AuthError::MalformedCredentials)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedCredentials)?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or(AuthError::MalformedCredentials)?;

        self.credentials
            .iter()
            .find(|c| c.username == user && c.password == pass)
            .map(|c| c.username.as_str())
            .ok_or(AuthError::BadCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AuthGate {
        AuthGate::new(vec![
            Credential {
                username: "alice".into(),
                password: "s3cret".into(),
            },
            Credential {
                username: "bob".into(),
                password: "pass:with:colons".into(),
            },
        ])
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn test_accepts_valid_credential() {
        let g = gate();
        assert_eq!(g.authenticate(Some(&basic("alice", "s3cret"))), Ok("alice"));
    }

    #[test]
    fn test_password_may_contain_colons() {
        let g = gate();
        assert_eq!(
            g.authenticate(Some(&basic("bob", "pass:with:colons"))),
            Ok("bob")
        );
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(gate().authenticate(None), Err(AuthError::MissingCredentials));
    }

    #[test]
    fn test_wrong_password() {
        assert_eq!(
            gate().authenticate(Some(&basic("alice", "wrong"))),
            Err(AuthError::BadCredentials)
        );
    }

    #[test]
    fn test_unknown_user() {
        assert_eq!(
            gate().authenticate(Some(&basic("mallory", "s3cret"))),
            Err(AuthError::BadCredentials)
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        assert_eq!(
            gate().authenticate(Some("Bearer abcdef")),
            Err(AuthError::UnsupportedScheme)
        );
        assert_eq!(
            gate().authenticate(Some("Basicnospace")),
            Err(AuthError::UnsupportedScheme)
        );
    }

    #[test]
    fn test_scheme_case_insensitive() {
        let b64 = BASE64.encode("alice:s3cret");
        assert_eq!(
            gate().authenticate(Some(&format!("basic {}", b64))),
            Ok("alice")
        );
        assert_eq!(
            gate().authenticate(Some(&format!("BASIC {}", b64))),
            Ok("alice")
        );
    }

    #[test]
    fn test_bad_base64() {
        assert_eq!(
            gate().authenticate(Some("Basic !!!not-base64!!!")),
            Err(AuthError::MalformedCredentials)
        );
    }

    #[test]
    fn test_no_colon_in_decoded() {
        let b64 = BASE64.encode("alicenopass");
        assert_eq!(
            gate().authenticate(Some(&format!("Basic {}", b64))),
            Err(AuthError::MalformedCredentials)
        );
    }
}
