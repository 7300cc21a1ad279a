//! Stage 4: confirm the principal's roles and permissions satisfy the endpoint.

use std::sync::Arc;

use super::{RequestScope, Stage, StageFuture, StageOutcome, upstream_denial};
use crate::auth::{Denial, DenialKind, StageName};
use crate::identity::{CheckUserAuthorizationRequest, CheckUserAuthorizationResponse, IdentityService};

pub struct AuthorizationStage {
    identity: Arc<dyn IdentityService>,
}

impl AuthorizationStage {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    async fn run(&self, scope: &mut RequestScope) -> StageOutcome {
        if !scope.route.authorize_principal {
            return StageOutcome::Skipped;
        }
        let Some(user) = scope.context.user_info.as_ref() else {
            // Route loading rejects authorization without authentication.
            return StageOutcome::Denied(Denial::internal(
                "authorization required but no principal was resolved",
            ));
        };
        if user.is_service() && !scope.route.authorize_service_tokens {
            return StageOutcome::Skipped;
        }

        let request = CheckUserAuthorizationRequest {
            user_id: user.subject().to_string(),
            service_name: scope.context.target_service().to_string(),
            endpoint: scope.context.path().to_string(),
            method: scope.context.method().to_string(),
            roles: user.roles.iter().cloned().collect(),
            permissions: user.permissions.iter().cloned().collect(),
        };
        let subject = request.user_id.clone();

        let response = match self.identity.check_user_authorization(request).await {
            Ok(response) => response,
            Err(e) => return StageOutcome::Denied(upstream_denial(self.name(), &e)),
        };

        if !response.is_authorized {
            return StageOutcome::Denied(
                Denial::forbidden(
                    DenialKind::InsufficientAuthorization,
                    refusal_details(&subject, &response),
                )
                .with_levels(response.current_level, response.required_level),
            );
        }

        StageOutcome::allowed(
            "Authorized",
            format!("{} authorized at {}", subject, response.current_level),
        )
    }
}

fn refusal_details(subject: &str, response: &CheckUserAuthorizationResponse) -> String {
    let mut details = format!(
        "{} refused: {}",
        subject,
        response.reason.as_deref().unwrap_or("not authorized")
    );
    if !response.missing_roles.is_empty() {
        details.push_str(&format!("; missing roles [{}]", response.missing_roles.join(",")));
    }
    if !response.missing_permissions.is_empty() {
        details.push_str(&format!(
            "; missing permissions [{}]",
            response.missing_permissions.join(",")
        ));
    }
    details
}

impl Stage for AuthorizationStage {
    fn name(&self) -> StageName {
        StageName::PrincipalAuthorization
    }

    fn evaluate<'a>(&'a self, scope: &'a mut RequestScope) -> StageFuture<'a> {
        Box::pin(self.run(scope))
    }
}
