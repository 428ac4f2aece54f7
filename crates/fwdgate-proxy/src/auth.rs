//! Shared-secret proxy authentication.
//!
//! Clients authenticate with `Proxy-Authorization: Basic base64(user:pass)`.
//! The username is ignored; only the password is compared against the
//! configured secret. With no secret configured every request passes.

use crate::headers::Headers;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

/// Challenge sent with every `407` response.
pub const PROXY_AUTHENTICATE: &str = "Basic realm=\"fwdgate\"";

/// Validates the optional shared secret.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    secret: Option<Zeroizing<String>>,
}

impl AuthGate {
    #[must_use]
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(|s| Zeroizing::new(s.to_string())),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether the request carries an acceptable credential.
    ///
    /// Missing header, a scheme other than Basic, undecodable credentials, a
    /// credential without a `:` separator, or a wrong password all fail.
    #[must_use]
    pub fn check(&self, headers: &Headers) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };

        let Some(value) = headers.get_all("proxy-authorization").next() else {
            debug!("Missing Proxy-Authorization header");
            return false;
        };

        match basic_password(value) {
            Some(password) => constant_time_eq(password.as_bytes(), secret.as_bytes()),
            None => {
                debug!("Malformed Proxy-Authorization header");
                false
            }
        }
    }
}

/// Extract the password from a `Basic` credential.
///
/// The scheme token is matched case-insensitively. Everything after the
/// first `:` of the decoded credential is the password, so passwords may
/// themselves contain colons.
fn basic_password(value: &str) -> Option<Zeroizing<String>> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
    let decoded = std::str::from_utf8(&decoded).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(Zeroizing::new(password.to_string()))
}

/// Constant-time comparison of two byte strings.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
