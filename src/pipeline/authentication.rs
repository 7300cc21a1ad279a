//! Stage 3: resolve the principal behind a bearer, token header or session
//! credential.
//!
//! Local verification is always tried first. Anything it cannot accept,
//! including opaque credentials, is handed to the identity service; a remote
//! success after a local miss is the normal path for opaque credentials and
//! for tokens minted under a scheme the cached key does not cover.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::{RequestScope, Stage, StageFuture, StageOutcome, upstream_denial};
use crate::auth::{
    Denial, DenialKind, FallbackReason, PrincipalCredential, PrincipalKind, StageName,
    TokenType, TokenVerifier, UserInfo, VerifyOutcome, fingerprint,
};
use crate::identity::{AuthenticateUserRequest, AuthenticateUserResponse, IdentityService};

pub struct AuthenticationStage {
    identity: Arc<dyn IdentityService>,
    verifier: Arc<TokenVerifier>,
}

impl AuthenticationStage {
    pub fn new(identity: Arc<dyn IdentityService>, verifier: Arc<TokenVerifier>) -> Self {
        Self { identity, verifier }
    }

    async fn run(&self, scope: &mut RequestScope) -> StageOutcome {
        if !scope.route.authenticate_principal {
            return StageOutcome::Skipped;
        }
        let Some(credential) = scope.credentials.principal.clone() else {
            return StageOutcome::Denied(Denial::unauthorized(
                DenialKind::MissingCredential,
                "no principal credential presented",
            ));
        };

        let reason = match self.verifier.verify(credential.value.expose()).await {
            VerifyOutcome::Verified(info) => {
                let details = format!(
                    "local verification: {} {}",
                    info.principal.as_str(),
                    info.subject()
                );
                scope.context.user_info = Some(info);
                return StageOutcome::allowed("LocalTokenVerified", details);
            }
            VerifyOutcome::NeedsRemoteCheck(reason) => reason,
        };

        debug!(
            request_id = %scope.context.request_id(),
            credential_fp = %fingerprint(credential.value.expose()),
            local = %reason,
            "falling back to remote authentication"
        );
        self.authenticate_remotely(scope, &credential, &reason).await
    }

    async fn authenticate_remotely(
        &self,
        scope: &mut RequestScope,
        credential: &PrincipalCredential,
        local: &FallbackReason,
    ) -> StageOutcome {
        let token_type = credential.token_type();
        let request = AuthenticateUserRequest {
            credential: credential.value.expose().to_string(),
            credential_kind: token_type,
            service_name: scope.context.target_service().to_string(),
            endpoint: scope.context.path().to_string(),
        };
        let response = match self.identity.authenticate_user(request).await {
            Ok(response) => response,
            Err(e) => {
                let mut denial = upstream_denial(self.name(), &e);
                denial.details = format!("local: {}; remote: {}", local, denial.details);
                return StageOutcome::Denied(denial);
            }
        };

        if !response.is_authenticated {
            let message = response
                .error_message
                .as_deref()
                .unwrap_or("credential rejected");
            let kind = if message.to_ascii_lowercase().contains("expired") {
                DenialKind::ExpiredCredential
            } else {
                DenialKind::InvalidCredential
            };
            return StageOutcome::Denied(Denial::unauthorized(
                kind,
                format!("local: {}; remote: {}", local, message),
            ));
        }

        let info = remote_user_info(response, token_type);
        let details = format!("local: {}; remote authenticated {}", local, info.subject());
        scope.context.user_info = Some(info);
        StageOutcome::allowed("RemoteAuthenticated", details)
    }
}

fn remote_user_info(response: AuthenticateUserResponse, token_type: TokenType) -> UserInfo {
    let user_name = response
        .user_name
        .or_else(|| response.user_id.clone())
        .unwrap_or_default();
    UserInfo {
        user_id: response.user_id,
        user_name,
        email: response.email,
        roles: response.roles.into_iter().collect::<BTreeSet<_>>(),
        permissions: response.permissions.into_iter().collect(),
        access_level: response.access_level,
        token_type,
        token_expires_at: response.token_expires_at,
        principal: PrincipalKind::User,
    }
}

impl Stage for AuthenticationStage {
    fn name(&self) -> StageName {
        StageName::PrincipalAuthentication
    }

    fn evaluate<'a>(&'a self, scope: &'a mut RequestScope) -> StageFuture<'a> {
        Box::pin(self.run(scope))
    }
}
