//! Stage 1: resolve the API key to a client identity.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::{RequestScope, Stage, StageFuture, StageOutcome, upstream_denial};
use crate::auth::{ApiKeyInfo, Denial, DenialKind, StageName, fingerprint, mask_api_key};
use crate::identity::{IdentityService, ValidateApiKeyRequest, ValidateApiKeyResponse};
use crate::types::KeyId;

pub struct ApiKeyStage {
    identity: Arc<dyn IdentityService>,
}

impl ApiKeyStage {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    async fn run(&self, scope: &mut RequestScope) -> StageOutcome {
        let Some(key) = scope.credentials.api_key.clone() else {
            if scope.route.require_api_key {
                return StageOutcome::Denied(Denial::unauthorized(
                    DenialKind::MissingCredential,
                    "no API key presented on a route that requires one",
                ));
            }
            return StageOutcome::Skipped;
        };

        let fp = fingerprint(key.expose());
        debug!(key_fp = %fp, service = %scope.context.target_service(), "validating API key");

        let request = ValidateApiKeyRequest {
            api_key: key.expose().to_string(),
            service_name: scope.context.target_service().to_string(),
            endpoint: scope.context.path().to_string(),
        };
        let response = match self.identity.validate_api_key(request).await {
            Ok(response) => response,
            Err(e) => return StageOutcome::Denied(upstream_denial(self.name(), &e)),
        };

        if !response.is_valid {
            return StageOutcome::Denied(rejected(&response, &fp));
        }
        if let Some(expires_at) = response.expires_at
            && expires_at <= Utc::now()
        {
            return StageOutcome::Denied(Denial::unauthorized(
                DenialKind::ExpiredCredential,
                format!("key {} expired at {}", fp, expires_at.to_rfc3339()),
            ));
        }

        let Some(key_id) = response.key_id.clone() else {
            return StageOutcome::Denied(Denial::unauthorized(
                DenialKind::InvalidCredential,
                "identity service accepted the key but returned no key id",
            ));
        };

        let details = format!(
            "key {} (fingerprint {}) belongs to client {}",
            key_id,
            fp,
            response.client_name.as_deref().unwrap_or("<unnamed>")
        );
        scope.context.api_key_info = Some(ApiKeyInfo {
            key_id: KeyId::new(key_id),
            masked_key: mask_api_key(key.expose()),
            client_name: response.client_name.unwrap_or_default(),
            access_level: response.access_level,
            allowed_services: response.allowed_services,
            allowed_endpoints: response.allowed_endpoints,
            expires_at: response.expires_at,
        });
        StageOutcome::allowed("ApiKeyValid", details)
    }
}

/// Denial for a key the identity service refused.
fn rejected(response: &ValidateApiKeyResponse, fp: &str) -> Denial {
    let message = response
        .error_message
        .as_deref()
        .unwrap_or("key rejected");
    let kind = if message.to_ascii_lowercase().contains("expired") {
        DenialKind::ExpiredCredential
    } else {
        DenialKind::InvalidCredential
    };
    Denial::unauthorized(kind, format!("key {}: {}", fp, message))
}

impl Stage for ApiKeyStage {
    fn name(&self) -> StageName {
        StageName::ApiKeyValidation
    }

    fn evaluate<'a>(&'a self, scope: &'a mut RequestScope) -> StageFuture<'a> {
        Box::pin(self.run(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, SecurityContext, Secret};
    use crate::identity::IdentityError;
    use crate::identity::fake::{Calls, FakeIdentityService};
    use crate::routing::RoutePolicy;
    use crate::types::{ApiAccessLevel, ServiceName};
    use chrono::Duration as ChronoDuration;
    use http::{Method, StatusCode};

    fn valid_key() -> ValidateApiKeyResponse {
        ValidateApiKeyResponse {
            is_valid: true,
            key_id: Some("key-1".to_string()),
            client_name: Some("Acme".to_string()),
            access_level: ApiAccessLevel::Standard,
            allowed_services: vec!["orders".to_string()],
            ..Default::default()
        }
    }

    fn scope(key: Option<&str>, route: RoutePolicy) -> RequestScope {
        RequestScope::new(
            SecurityContext::new("/orders/1", Method::GET, ServiceName::new("orders")),
            Credentials {
                api_key: key.map(Secret::new),
                principal: None,
            },
            route,
        )
    }

    #[tokio::test]
    async fn test_valid_key_populates_info() {
        let fake = Arc::new(FakeIdentityService::new().with_api_key("gk_live_abcdef", valid_key()));
        let stage = ApiKeyStage::new(fake.clone());
        let mut scope = scope(Some("gk_live_abcdef"), RoutePolicy::api_key_only("/orders", "orders"));

        let outcome = stage.evaluate(&mut scope).await;
        let StageOutcome::Allowed { reason, details } = outcome else {
            panic!("expected allow");
        };
        assert_eq!(reason, "ApiKeyValid");
        assert!(details.starts_with("key key-1 (fingerprint "));
        assert!(details.ends_with("belongs to client Acme"));
        assert!(!details.contains("gk_live_abcdef"));

        let info = scope.context.api_key_info.unwrap();
        assert_eq!(info.key_id.as_str(), "key-1");
        assert_eq!(info.masked_key, "gk_liv****");
        assert_eq!(info.client_name, "Acme");
        assert_eq!(info.access_level, ApiAccessLevel::Standard);
        assert_eq!(Calls::get(&fake.calls.validate_api_key), 1);
    }

    #[tokio::test]
    async fn test_missing_key_on_required_route() {
        let fake = Arc::new(FakeIdentityService::new());
        let stage = ApiKeyStage::new(fake.clone());
        let mut scope = scope(None, RoutePolicy::api_key_only("/orders", "orders"));

        let StageOutcome::Denied(denial) = stage.evaluate(&mut scope).await else {
            panic!("expected denial");
        };
        assert_eq!(denial.kind, DenialKind::MissingCredential);
        assert_eq!(denial.status, StatusCode::UNAUTHORIZED);
        assert_eq!(Calls::get(&fake.calls.validate_api_key), 0);
    }

    #[tokio::test]
    async fn test_missing_key_on_optional_route_skips() {
        let stage = ApiKeyStage::new(Arc::new(FakeIdentityService::new()));
        let route = RoutePolicy::api_key_only("/public", "public").without_api_key();
        let mut scope = scope(None, route);

        assert!(matches!(stage.evaluate(&mut scope).await, StageOutcome::Skipped));
        assert!(scope.context.api_key_info.is_none());
    }

    #[tokio::test]
    async fn test_unknown_key_is_invalid() {
        let stage = ApiKeyStage::new(Arc::new(FakeIdentityService::new()));
        let mut scope = scope(Some("nope"), RoutePolicy::api_key_only("/orders", "orders"));

        let StageOutcome::Denied(denial) = stage.evaluate(&mut scope).await else {
            panic!("expected denial");
        };
        assert_eq!(denial.kind, DenialKind::InvalidCredential);
        assert!(!denial.details.contains("nope"));
    }

    #[tokio::test]
    async fn test_expired_key() {
        let mut response = valid_key();
        response.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
        let fake = FakeIdentityService::new().with_api_key("old", response).with_api_key(
            "revoked",
            ValidateApiKeyResponse {
                error_message: Some("API key has EXPIRED".to_string()),
                ..Default::default()
            },
        );
        let stage = ApiKeyStage::new(Arc::new(fake));

        for key in ["old", "revoked"] {
            let mut scope = scope(Some(key), RoutePolicy::api_key_only("/orders", "orders"));
            let StageOutcome::Denied(denial) = stage.evaluate(&mut scope).await else {
                panic!("expected denial for {}", key);
            };
            assert_eq!(denial.kind, DenialKind::ExpiredCredential);
            assert!(scope.context.api_key_info.is_none());
        }
    }

    #[tokio::test]
    async fn test_transport_error_fails_closed() {
        let fake = FakeIdentityService::new().with_api_key("gk_live_abcdef", valid_key());
        fake.set_outage(Some(IdentityError::Transport("connection refused".to_string())));
        let stage = ApiKeyStage::new(Arc::new(fake));
        let mut scope = scope(Some("gk_live_abcdef"), RoutePolicy::api_key_only("/orders", "orders"));

        let StageOutcome::Denied(denial) = stage.evaluate(&mut scope).await else {
            panic!("expected denial");
        };
        assert_eq!(denial.kind, DenialKind::UpstreamUnavailable);
        assert_eq!(denial.status, StatusCode::UNAUTHORIZED);
        assert!(denial.details.contains("connection refused"));
    }
}
