// Core modules
pub mod auth;
pub mod config;
pub mod headers;
pub mod identity;
pub mod pipeline;
pub mod routing;
pub mod server;
pub mod types;

// Re-export key types and functions
pub use auth::{Denial, DenialKind, KeyCache, SecurityContext, SecurityDecision, StageName, TokenVerifier};
pub use config::{GatewayConfig, load_config, resolve_config_path};
pub use identity::{HttpIdentityClient, IdentityService};
pub use pipeline::{Pipeline, RequestScope};
pub use routing::{RoutePolicy, RouteTable};
pub use server::{Gateway, GatewayState, HttpForwarder, NextHop, create_router, serve};

use std::sync::Arc;

use anyhow::{Context, Result};

/// A gateway assembled from configuration, plus the key cache whose refresh
/// the caller is expected to schedule.
pub struct GatewayRuntime {
    pub state: GatewayState,
    pub keys: Arc<KeyCache>,
}

/// Convenience function to build a fully wired gateway.
///
/// Creates the identity-service client, the verification-key cache, the
/// token verifier and the standard pipeline. No network traffic happens
/// here; the key is fetched lazily or by [`KeyCache::spawn_periodic_refresh`].
pub fn create_gateway(config: &GatewayConfig) -> Result<GatewayRuntime> {
    let identity: Arc<dyn IdentityService> = Arc::new(
        HttpIdentityClient::new(&config.identity.base_url, config.identity.timeout())
            .context("Failed to build identity-service client")?,
    );

    let keys = Arc::new(KeyCache::new(
        identity.clone(),
        config.tokens.algorithm()?,
        config.tokens.min_refresh_interval(),
    ));
    let verifier = Arc::new(TokenVerifier::new(keys.clone(), config.tokens.settings()));
    let pipeline = Pipeline::standard(identity, verifier, config.pipeline.stage_timeout());

    let sanitizer = headers::HeaderSanitizer::new(&config.sanitizer, &config.credentials)
        .context("Invalid header sanitizer pattern")?;
    let forwarder = reqwest::Client::builder()
        .build()
        .context("Failed to build forwarding client")?;

    let gateway = Gateway::new(
        config.route_table(),
        pipeline,
        config.credentials.clone(),
        sanitizer,
        Arc::new(HttpForwarder::new(forwarder)),
    );

    Ok(GatewayRuntime {
        state: Arc::new(gateway),
        keys,
    })
}
