//! The ordered, fail-fast security pipeline.
//!
//! Each stage inspects the request scope and either skips, allows (recording a
//! decision and advancing) or denies (recording a decision and terminating).
//! The runner times every stage, bounds it with a deadline and is the only
//! place decisions are appended, so no stage can run after a denial.

mod access_tier;
mod api_key;
mod authentication;
mod authorization;

pub use access_tier::AccessTierStage;
pub use api_key::ApiKeyStage;
pub use authentication::AuthenticationStage;
pub use authorization::AuthorizationStage;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::auth::{Credentials, Denial, SecurityContext, SecurityDecision, StageName, TokenVerifier};
use crate::identity::{IDENTITY_SERVICE, IdentityError, IdentityService};
use crate::routing::RoutePolicy;

/// Default deadline for a single stage (3 seconds).
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 3000;

/// Everything a stage may look at or change for one request.
#[derive(Debug)]
pub struct RequestScope {
    pub context: SecurityContext,
    pub credentials: Credentials,
    pub route: RoutePolicy,
}

impl RequestScope {
    pub fn new(context: SecurityContext, credentials: Credentials, route: RoutePolicy) -> Self {
        Self {
            context,
            credentials,
            route,
        }
    }

    /// Drop the raw credentials and hand back the context.
    pub fn finish(self) -> SecurityContext {
        self.context
    }
}

/// What a stage decided.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Stage does not apply; nothing is recorded.
    Skipped,
    Allowed {
        reason: &'static str,
        details: String,
    },
    Denied(Denial),
}

impl StageOutcome {
    pub fn allowed(reason: &'static str, details: impl Into<String>) -> Self {
        Self::Allowed {
            reason,
            details: details.into(),
        }
    }
}

/// Boxed future returned by [`Stage::evaluate`].
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = StageOutcome> + Send + 'a>>;

/// One step of the pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    fn evaluate<'a>(&'a self, scope: &'a mut RequestScope) -> StageFuture<'a>;
}

/// Map an identity-service failure to a closed-fail denial for `stage`.
pub(crate) fn upstream_denial(stage: StageName, err: &IdentityError) -> Denial {
    Denial::upstream(stage.denial_status(), err.to_string())
}

/// Runs stages in order until one denies.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    stage_timeout: Duration,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>, stage_timeout: Duration) -> Self {
        Self {
            stages,
            stage_timeout,
        }
    }

    /// The standard four-stage pipeline.
    pub fn standard(
        identity: Arc<dyn IdentityService>,
        verifier: Arc<TokenVerifier>,
        stage_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Box::new(ApiKeyStage::new(identity.clone())),
                Box::new(AccessTierStage::new(identity.clone())),
                Box::new(AuthenticationStage::new(identity.clone(), verifier)),
                Box::new(AuthorizationStage::new(identity)),
            ],
            stage_timeout,
        )
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage against `scope`. Returns the terminal denial, if any.
    ///
    /// If this future is dropped mid-stage, the in-flight stage (and its
    /// remote call) is dropped with it and no decision is recorded for it.
    pub async fn run(&self, scope: &mut RequestScope) -> Result<(), Denial> {
        for stage in &self.stages {
            let name = stage.name();
            let started = Instant::now();

            let outcome = match tokio::time::timeout(self.stage_timeout, stage.evaluate(scope)).await
            {
                Ok(outcome) => outcome,
                Err(_) => StageOutcome::Denied(upstream_denial(name, &IdentityError::Timeout)),
            };
            let elapsed = started.elapsed();

            match outcome {
                StageOutcome::Skipped => {
                    debug!(stage = %name, request_id = %scope.context.request_id(), "stage skipped");
                }
                StageOutcome::Allowed { reason, details } => {
                    debug!(
                        stage = %name,
                        request_id = %scope.context.request_id(),
                        reason,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "stage allowed"
                    );
                    scope.context.record(SecurityDecision {
                        stage: name,
                        allowed: true,
                        reason: reason.to_string(),
                        details,
                        elapsed,
                    });
                }
                StageOutcome::Denied(denial) => {
                    log_denial(name, &scope.context, &denial, elapsed);
                    scope.context.record(SecurityDecision {
                        stage: name,
                        allowed: false,
                        reason: denial.kind.as_str().to_string(),
                        details: denial.details.clone(),
                        elapsed,
                    });
                    return Err(denial);
                }
            }
        }
        Ok(())
    }
}

fn log_denial(stage: StageName, ctx: &SecurityContext, denial: &Denial, elapsed: Duration) {
    let request_id = ctx.request_id();
    let elapsed_ms = elapsed.as_millis() as u64;
    if denial.kind.is_expected() {
        info!(
            stage = %stage,
            %request_id,
            path = ctx.path(),
            service = %ctx.target_service(),
            reason = %denial.kind,
            status = denial.status.as_u16(),
            elapsed_ms,
            "request denied"
        );
    } else if denial.kind == crate::auth::DenialKind::UpstreamUnavailable {
        warn!(
            stage = %stage,
            %request_id,
            dependency = IDENTITY_SERVICE,
            details = %denial.details,
            elapsed_ms,
            "dependency unavailable, failing closed"
        );
    } else {
        error!(
            stage = %stage,
            %request_id,
            path = ctx.path(),
            method = %ctx.method(),
            service = %ctx.target_service(),
            details = %denial.details,
            elapsed_ms,
            "internal fault in security pipeline"
        );
    }
}
