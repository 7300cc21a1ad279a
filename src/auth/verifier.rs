//! Local verification of self-contained signed tokens.
//!
//! The verifier either resolves a principal on its own or tells the caller
//! why it could not, so the remote fallback is visible in the return type
//! rather than hidden in error handling.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::context::{PrincipalKind, TokenType, UserInfo};
use crate::auth::extractor::looks_like_signed_token;
use crate::auth::key_cache::KeyCache;
use crate::types::UserAccessLevel;

/// Default clock-skew allowance for `exp`/`nbf` checks (5 minutes).
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 300;

/// Claim checks applied to every locally verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Expected `iss`
    pub issuer: Option<String>,
    /// Expected `aud`
    pub audience: Option<String>,
    /// Allowed clock skew in seconds
    pub clock_skew_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECONDS,
        }
    }
}

/// Why a credential could not be verified locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// Not shaped like a signed token (opaque credential).
    NotSelfContained,
    /// Token header could not be decoded.
    Malformed(String),
    /// No verification key is loaded and loading failed.
    KeyUnavailable,
    /// Token was signed with a key id other than the cached one.
    UnknownKeyId(String),
    /// Token algorithm differs from the cached key's algorithm.
    AlgorithmMismatch,
    Expired,
    BadSignature,
    /// Issuer, audience, not-before or a custom claim was rejected.
    ClaimsRejected(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSelfContained => write!(f, "not a self-contained token"),
            Self::Malformed(msg) => write!(f, "malformed token: {}", msg),
            Self::KeyUnavailable => write!(f, "verification key unavailable"),
            Self::UnknownKeyId(kid) => write!(f, "unknown key id: {}", kid),
            Self::AlgorithmMismatch => write!(f, "algorithm mismatch"),
            Self::Expired => write!(f, "token expired"),
            Self::BadSignature => write!(f, "bad signature"),
            Self::ClaimsRejected(msg) => write!(f, "claims rejected: {}", msg),
        }
    }
}

/// Result of a local verification attempt.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Verified(UserInfo),
    NeedsRemoteCheck(FallbackReason),
}

/// Claims read from a verified token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// "user" (default) or "service"
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub access_level: Option<String>,
    pub exp: i64,
}

impl TokenClaims {
    fn principal_kind(&self) -> Result<PrincipalKind, FallbackReason> {
        match self.token_type.as_deref() {
            None | Some("user") => Ok(PrincipalKind::User),
            Some("service") => Ok(PrincipalKind::Service),
            Some(other) => Err(FallbackReason::ClaimsRejected(format!(
                "unknown token_type {}",
                other
            ))),
        }
    }

    /// Build the principal. Service tokens carry only a name and roles.
    fn into_user_info(self) -> Result<UserInfo, FallbackReason> {
        let principal = self.principal_kind()?;
        let access_level = match self.access_level.as_deref() {
            Some(level) => level
                .parse::<UserAccessLevel>()
                .map_err(|e| FallbackReason::ClaimsRejected(e.to_string()))?,
            None if principal == PrincipalKind::User => UserAccessLevel::User,
            None => UserAccessLevel::None,
        };
        let token_expires_at = DateTime::<Utc>::from_timestamp(self.exp, 0);
        let roles: BTreeSet<String> = self.roles.into_iter().collect();

        Ok(match principal {
            PrincipalKind::Service => UserInfo {
                user_id: None,
                user_name: self.name.unwrap_or(self.sub),
                email: None,
                roles,
                permissions: BTreeSet::new(),
                access_level,
                token_type: TokenType::Jwt,
                token_expires_at,
                principal,
            },
            PrincipalKind::User => UserInfo {
                user_name: self
                    .name
                    .or(self.preferred_username)
                    .unwrap_or_else(|| self.sub.clone()),
                user_id: Some(self.sub),
                email: self.email,
                roles,
                permissions: self.permissions.into_iter().collect(),
                access_level,
                token_type: TokenType::Jwt,
                token_expires_at,
                principal,
            },
        })
    }
}

/// Verifies signed tokens against the cached public key.
pub struct TokenVerifier {
    keys: Arc<KeyCache>,
    settings: TokenSettings,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyCache>, settings: TokenSettings) -> Self {
        Self { keys, settings }
    }

    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Try to resolve a principal from `token` without calling the identity service
    /// for anything but (at most) the verification key.
    pub async fn verify(&self, token: &str) -> VerifyOutcome {
        match self.try_verify(token).await {
            Ok(info) => VerifyOutcome::Verified(info),
            Err(reason) => {
                debug!(reason = %reason, "local token verification did not succeed");
                VerifyOutcome::NeedsRemoteCheck(reason)
            }
        }
    }

    async fn try_verify(&self, token: &str) -> Result<UserInfo, FallbackReason> {
        if !looks_like_signed_token(token) {
            return Err(FallbackReason::NotSelfContained);
        }

        let header =
            decode_header(token).map_err(|e| FallbackReason::Malformed(e.to_string()))?;

        let key = self
            .keys
            .current_or_load()
            .await
            .ok_or(FallbackReason::KeyUnavailable)?;

        if let Some(kid) = header.kid.as_deref()
            && kid != key.key_id
        {
            // The identity service may have rotated its key.
            self.keys.spawn_refresh();
            return Err(FallbackReason::UnknownKeyId(kid.to_string()));
        }
        if header.alg != key.algorithm {
            return Err(FallbackReason::AlgorithmMismatch);
        }

        let validation = self.validation(&key.algorithm);
        let data = decode::<TokenClaims>(token, &key.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => FallbackReason::Expired,
                ErrorKind::InvalidSignature => FallbackReason::BadSignature,
                ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience
                | ErrorKind::ImmatureSignature
                | ErrorKind::MissingRequiredClaim(_) => FallbackReason::ClaimsRejected(e.to_string()),
                _ => FallbackReason::Malformed(e.to_string()),
            })?;

        data.claims.into_user_info()
    }

    fn validation(&self, algorithm: &jsonwebtoken::Algorithm) -> Validation {
        let mut validation = Validation::new(*algorithm);
        validation.leeway = self.settings.clock_skew_secs;
        validation.validate_nbf = true;

        let mut required = vec!["exp"];
        if let Some(issuer) = &self.settings.issuer {
            validation.set_issuer(&[issuer]);
            required.push("iss");
        }
        match &self.settings.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                required.push("aud");
            }
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&required);
        validation
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    //! Helpers for minting signed test tokens.

    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::{Value, json};

    pub const ISSUER: &str = "https://identity.test";
    pub const AUDIENCE: &str = "gateway";

    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Sign `claims` with an Ed25519 private key under `kid`.
    pub fn sign(private_pem: &str, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_ed_pem(private_pem.as_bytes()).unwrap();
        encode(&header, claims, &key).unwrap()
    }

    pub fn user_claims(sub: &str, exp_offset_secs: i64) -> Value {
        json!({
            "sub": sub,
            "name": "Jane Doe",
            "email": "jane@example.com",
            "roles": ["reader", "editor"],
            "permissions": ["orders:read"],
            "token_type": "user",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now() + exp_offset_secs,
        })
    }

    pub fn service_claims(name: &str, exp_offset_secs: i64) -> Value {
        json!({
            "sub": name,
            "roles": ["internal"],
            "permissions": ["should-be-ignored"],
            "token_type": "service",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now() + exp_offset_secs,
        })
    }
}
