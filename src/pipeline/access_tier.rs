//! Stage 2: confirm the resolved client meets the endpoint's minimum tier.

use std::sync::Arc;

use super::{RequestScope, Stage, StageFuture, StageOutcome, upstream_denial};
use crate::auth::{Denial, DenialKind, StageName};
use crate::identity::{CheckApiAccessRequest, IdentityService};

pub struct AccessTierStage {
    identity: Arc<dyn IdentityService>,
}

impl AccessTierStage {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self { identity }
    }

    async fn run(&self, scope: &mut RequestScope) -> StageOutcome {
        if scope.context.api_key_info.is_none() {
            return StageOutcome::Skipped;
        }
        let Some(key) = scope.credentials.api_key.clone() else {
            return StageOutcome::Denied(Denial::internal(
                "API key info present without the raw key",
            ));
        };

        let request = CheckApiAccessRequest {
            api_key: key.expose().to_string(),
            service_name: scope.context.target_service().to_string(),
            endpoint: scope.context.path().to_string(),
            method: scope.context.method().to_string(),
        };
        let response = match self.identity.check_api_access(request).await {
            Ok(response) => response,
            Err(e) => return StageOutcome::Denied(upstream_denial(self.name(), &e)),
        };

        // The check's level is authoritative over the one cached by stage 1.
        if let Some(info) = scope.context.api_key_info.as_mut() {
            info.access_level = response.current_level;
        }

        if !response.has_access {
            let reason = response.reason.as_deref().unwrap_or("tier too low");
            return StageOutcome::Denied(
                Denial::forbidden(
                    DenialKind::InsufficientTier,
                    format!(
                        "{} (current {}, required {})",
                        reason, response.current_level, response.required_level
                    ),
                )
                .with_levels(response.current_level, response.required_level),
            );
        }

        StageOutcome::allowed(
            "TierSatisfied",
            format!(
                "current {} satisfies required {}",
                response.current_level, response.required_level
            ),
        )
    }
}

impl Stage for AccessTierStage {
    fn name(&self) -> StageName {
        StageName::AccessTierCheck
    }

    fn evaluate<'a>(&'a self, scope: &'a mut RequestScope) -> StageFuture<'a> {
        Box::pin(self.run(scope))
    }
}
