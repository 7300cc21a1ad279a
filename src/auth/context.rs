//! Request-scoped security context.
//!
//! One `SecurityContext` is created per request at pipeline entry, mutated in
//! place by the stages and read once when forwarding headers are built. It is
//! never cached or shared across requests.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::types::{ApiAccessLevel, KeyId, RequestId, ServiceName, UserAccessLevel};

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    ApiKeyValidation,
    AccessTierCheck,
    PrincipalAuthentication,
    PrincipalAuthorization,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKeyValidation => "ApiKeyValidation",
            Self::AccessTierCheck => "AccessTierCheck",
            Self::PrincipalAuthentication => "PrincipalAuthentication",
            Self::PrincipalAuthorization => "PrincipalAuthorization",
        }
    }

    /// HTTP status used when this stage denies a request.
    ///
    /// Credential stages answer 401, tier and authorization stages answer 403.
    pub fn denial_status(&self) -> http::StatusCode {
        match self {
            Self::ApiKeyValidation | Self::PrincipalAuthentication => {
                http::StatusCode::UNAUTHORIZED
            }
            Self::AccessTierCheck | Self::PrincipalAuthorization => http::StatusCode::FORBIDDEN,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage that actually ran.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityDecision {
    pub stage: StageName,
    pub allowed: bool,
    /// Short machine string, e.g. "ApiKeyValid" or "MissingCredential".
    pub reason: String,
    /// Free text for diagnostics. Never returned to the caller.
    pub details: String,
    pub elapsed: Duration,
}

/// Identity resolved from an API key by stage 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeyInfo {
    pub key_id: KeyId,
    /// First few characters of the key followed by a mask.
    pub masked_key: String,
    pub client_name: String,
    pub access_level: ApiAccessLevel,
    pub allowed_services: Vec<String>,
    pub allowed_endpoints: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// How the principal credential was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "JWT")]
    Jwt,
    Opaque,
    Session,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "JWT",
            Self::Opaque => "Opaque",
            Self::Session => "Session",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the principal is a human user or a calling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    #[default]
    User,
    Service,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
        }
    }
}

/// Principal resolved by stage 3.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    /// Absent for service principals.
    pub user_id: Option<String>,
    pub user_name: String,
    pub email: Option<String>,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub access_level: UserAccessLevel,
    pub token_type: TokenType,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub principal: PrincipalKind,
}

impl UserInfo {
    /// Subject passed to the authorization check: the user id when known,
    /// otherwise the principal name.
    pub fn subject(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.user_name)
    }

    pub fn is_service(&self) -> bool {
        self.principal == PrincipalKind::Service
    }
}

/// Per-request accumulator of stage decisions and resolved identities.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    request_id: RequestId,
    path: String,
    method: Method,
    target_service: ServiceName,
    decisions: Vec<SecurityDecision>,
    pub api_key_info: Option<ApiKeyInfo>,
    pub user_info: Option<UserInfo>,
}

impl SecurityContext {
    /// Create a new context at pipeline entry with a freshly generated request id.
    pub fn new(path: impl Into<String>, method: Method, target_service: ServiceName) -> Self {
        Self::with_request_id(RequestId::generate(), path, method, target_service)
    }

    pub fn with_request_id(
        request_id: RequestId,
        path: impl Into<String>,
        method: Method,
        target_service: ServiceName,
    ) -> Self {
        Self {
            request_id,
            path: path.into(),
            method,
            target_service,
            decisions: Vec::new(),
            api_key_info: None,
            user_info: None,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target_service(&self) -> &ServiceName {
        &self.target_service
    }

    /// Append a decision. Decisions are never edited or removed once recorded.
    pub fn record(&mut self, decision: SecurityDecision) {
        self.decisions.push(decision);
    }

    /// Decisions in the order the stages ran.
    pub fn decisions(&self) -> &[SecurityDecision] {
        &self.decisions
    }

    /// The decision recorded for `stage`, if that stage ran.
    pub fn decision(&self, stage: StageName) -> Option<&SecurityDecision> {
        self.decisions.iter().find(|d| d.stage == stage)
    }

    /// True once every recorded decision allowed the request.
    pub fn all_allowed(&self) -> bool {
        self.decisions.iter().all(|d| d.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(stage: StageName, allowed: bool) -> SecurityDecision {
        SecurityDecision {
            stage,
            allowed,
            reason: if allowed { "ok" } else { "denied" }.to_string(),
            details: String::new(),
            elapsed: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_context_records_decisions_in_order() {
        let mut ctx = SecurityContext::new("/orders", Method::GET, ServiceName::new("orders"));
        ctx.record(decision(StageName::ApiKeyValidation, true));
        ctx.record(decision(StageName::AccessTierCheck, false));

        let stages: Vec<_> = ctx.decisions().iter().map(|d| d.stage).collect();
        assert_eq!(
            stages,
            vec![StageName::ApiKeyValidation, StageName::AccessTierCheck]
        );
        assert!(!ctx.all_allowed());
        assert!(ctx.decision(StageName::PrincipalAuthorization).is_none());
    }

    #[test]
    fn test_context_identity() {
        let ctx = SecurityContext::with_request_id(
            RequestId::new("req-1"),
            "/weather/forecast",
            Method::POST,
            ServiceName::new("weather"),
        );
        assert_eq!(ctx.request_id().as_str(), "req-1");
        assert_eq!(ctx.path(), "/weather/forecast");
        assert_eq!(ctx.method(), &Method::POST);
        assert_eq!(ctx.target_service().as_str(), "weather");
        assert!(ctx.all_allowed());
    }

    #[test]
    fn test_stage_denial_status() {
        assert_eq!(
            StageName::ApiKeyValidation.denial_status(),
            http::StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            StageName::PrincipalAuthorization.denial_status(),
            http::StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_user_info_subject() {
        let mut info = UserInfo {
            user_id: Some("u-1".to_string()),
            user_name: "jane".to_string(),
            email: None,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            access_level: UserAccessLevel::User,
            token_type: TokenType::Jwt,
            token_expires_at: None,
            principal: PrincipalKind::User,
        };
        assert_eq!(info.subject(), "u-1");
        info.user_id = None;
        info.principal = PrincipalKind::Service;
        assert_eq!(info.subject(), "jane");
        assert!(info.is_service());
    }
}
