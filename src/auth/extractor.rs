//! Credential extraction from HTTP request headers.
//!
//! Pure parsing, no I/O. Two credential families are extracted independently:
//! the API key and the principal credential. Raw values are wrapped in
//! [`Secret`] so they cannot end up in logs through `Debug`.

use std::fmt;

use base64::Engine;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::context::TokenType;

/// Number of leading key characters kept in a masked API key.
pub const MASKED_KEY_PREFIX_LEN: usize = 6;

/// Header and cookie names the extractor reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Header carrying the API key
    pub api_key_header: String,
    /// Custom header carrying a principal token
    pub token_header: String,
    /// Cookie carrying a session credential
    pub session_cookie: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            api_key_header: "X-API-Key".to_string(),
            token_header: "X-Auth-Token".to_string(),
            session_cookie: "session".to_string(),
        }
    }
}

/// A credential value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value. Call sites are the remote validator and the
    /// local verifier only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(fp:{})", fingerprint(&self.0))
    }
}

/// Where the principal credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalSource {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// The configured custom token header
    TokenHeader,
    /// The configured session cookie
    SessionCookie,
}

/// The principal credential family.
#[derive(Debug, Clone)]
pub struct PrincipalCredential {
    pub value: Secret,
    pub source: PrincipalSource,
}

impl PrincipalCredential {
    /// Whether the value has the shape of a self-contained signed token.
    pub fn is_self_contained(&self) -> bool {
        looks_like_signed_token(self.value.expose())
    }

    /// Credential kind reported to the identity service.
    pub fn token_type(&self) -> TokenType {
        match self.source {
            PrincipalSource::SessionCookie => TokenType::Session,
            _ if self.is_self_contained() => TokenType::Jwt,
            _ => TokenType::Opaque,
        }
    }
}

/// Candidate credentials pulled out of one request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<Secret>,
    pub principal: Option<PrincipalCredential>,
}

impl Credentials {
    /// Extract both credential families from request headers.
    ///
    /// The principal credential is taken from the first match of: Bearer
    /// authorization, custom token header, session cookie.
    pub fn extract(headers: &HeaderMap, config: &CredentialConfig) -> Self {
        let api_key = header_str(headers, &config.api_key_header).map(Secret::new);

        let principal = bearer_token(headers)
            .map(|token| PrincipalCredential {
                value: Secret::new(token),
                source: PrincipalSource::Bearer,
            })
            .or_else(|| {
                header_str(headers, &config.token_header).map(|token| PrincipalCredential {
                    value: Secret::new(token),
                    source: PrincipalSource::TokenHeader,
                })
            })
            .or_else(|| {
                cookie_value(headers, &config.session_cookie).map(|token| PrincipalCredential {
                    value: Secret::new(token),
                    source: PrincipalSource::SessionCookie,
                })
            });

        Self { api_key, principal }
    }
}

/// Trimmed, non-empty header value.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_str(headers, http::header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

/// True if `token` has three dot-separated segments and the first decodes
/// to a JSON object carrying an `alg` member.
pub fn looks_like_signed_token(token: &str) -> bool {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return false;
    }

    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header.trim_end_matches('='))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .is_some_and(|v| v.get("alg").is_some())
}

/// Short SHA-256 fingerprint of a credential for correlating log lines.
pub fn fingerprint(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// Keep the first few characters of an API key and mask the rest.
pub fn mask_api_key(key: &str) -> String {
    if key.chars().count() <= MASKED_KEY_PREFIX_LEN {
        return "****".to_string();
    }
    let prefix: String = key.chars().take(MASKED_KEY_PREFIX_LEN).collect();
    format!("{}****", prefix)
}
