//! Client-side contract of the external identity service.
//!
//! The gateway never stores credentials; it asks the identity service to
//! validate API keys, check access tiers, authenticate opaque principal
//! credentials and authorize principals, and pulls the public verification
//! key used for local token checks from it.

mod client;

pub use client::HttpIdentityClient;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::TokenType;
use crate::types::{ApiAccessLevel, UserAccessLevel};

/// Dependency name used in log lines and decision details.
pub const IDENTITY_SERVICE: &str = "identity-service";

/// Boxed future returned by identity service operations.
pub type IdentityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IdentityError>> + Send + 'a>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateApiKeyRequest {
    pub api_key: String,
    pub service_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidateApiKeyResponse {
    pub is_valid: bool,
    pub error_message: Option<String>,
    pub key_id: Option<String>,
    pub client_name: Option<String>,
    pub access_level: ApiAccessLevel,
    pub allowed_services: Vec<String>,
    pub allowed_endpoints: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckApiAccessRequest {
    pub api_key: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckApiAccessResponse {
    pub has_access: bool,
    pub reason: Option<String>,
    pub required_level: ApiAccessLevel,
    pub current_level: ApiAccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateUserRequest {
    pub credential: String,
    pub credential_kind: TokenType,
    pub service_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticateUserResponse {
    pub is_authenticated: bool,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub access_level: UserAccessLevel,
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUserAuthorizationRequest {
    pub user_id: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckUserAuthorizationResponse {
    pub is_authorized: bool,
    pub reason: Option<String>,
    pub required_level: UserAccessLevel,
    pub current_level: UserAccessLevel,
    pub missing_roles: Vec<String>,
    pub missing_permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicVerificationKey {
    pub key_pem: String,
    pub key_id: String,
    /// Signing algorithm, e.g. "RS256". Falls back to the configured default.
    #[serde(default)]
    pub algorithm: Option<String>,
}

/// Operations the gateway needs from the identity service.
///
/// Every call is a single attempt; callers never retry.
pub trait IdentityService: Send + Sync {
    fn validate_api_key(
        &self,
        request: ValidateApiKeyRequest,
    ) -> IdentityFuture<'_, ValidateApiKeyResponse>;

    fn check_api_access(
        &self,
        request: CheckApiAccessRequest,
    ) -> IdentityFuture<'_, CheckApiAccessResponse>;

    fn authenticate_user(
        &self,
        request: AuthenticateUserRequest,
    ) -> IdentityFuture<'_, AuthenticateUserResponse>;

    fn check_user_authorization(
        &self,
        request: CheckUserAuthorizationRequest,
    ) -> IdentityFuture<'_, CheckUserAuthorizationResponse>;

    fn public_verification_key(&self) -> IdentityFuture<'_, PublicVerificationKey>;
}

/// Errors talking to the identity service.
#[derive(Debug, Clone)]
pub enum IdentityError {
    /// Connection or request failure.
    Transport(String),
    /// The call exceeded its deadline.
    Timeout,
    /// Non-success HTTP status.
    Status(u16),
    /// Response body could not be decoded.
    Decode(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "{} transport error: {}", IDENTITY_SERVICE, msg),
            Self::Timeout => write!(f, "{} timed out", IDENTITY_SERVICE),
            Self::Status(code) => write!(f, "{} returned HTTP {}", IDENTITY_SERVICE, code),
            Self::Decode(msg) => write!(f, "{} response undecodable: {}", IDENTITY_SERVICE, msg),
        }
    }
}

impl std::error::Error for IdentityError {}
