//! Path to service mapping.
//!
//! Routes are matched by longest prefix on path-segment boundaries, so
//! `/orders` matches `/orders` and `/orders/17` but not `/ordersx`.

use serde::{Deserialize, Serialize};

use crate::types::ServiceName;

fn default_true() -> bool {
    true
}

/// Security requirements and target of one route prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Path prefix, e.g. "/orders"
    pub prefix: String,
    /// Logical service name sent to the identity service
    pub service: ServiceName,
    /// Base URL of the backend this route forwards to
    #[serde(default)]
    pub upstream: Option<String>,
    /// Whether an API key must be presented
    #[serde(default = "default_true")]
    pub require_api_key: bool,
    /// Whether a principal credential must be presented and authenticated
    #[serde(default)]
    pub authenticate_principal: bool,
    /// Whether the authenticated principal must pass the authorization check
    #[serde(default)]
    pub authorize_principal: bool,
    /// Whether service principals are also subject to the authorization check
    #[serde(default)]
    pub authorize_service_tokens: bool,
}

impl RoutePolicy {
    /// A route requiring only an API key.
    pub fn api_key_only(prefix: impl Into<String>, service: impl Into<ServiceName>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
            upstream: None,
            require_api_key: true,
            authenticate_principal: false,
            authorize_principal: false,
            authorize_service_tokens: false,
        }
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_principal(mut self, authorize: bool) -> Self {
        self.authenticate_principal = true;
        self.authorize_principal = authorize;
        self
    }

    pub fn without_api_key(mut self) -> Self {
        self.require_api_key = false;
        self
    }

    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// All configured routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RoutePolicy>,
}

impl RouteTable {
    pub fn new(routes: Vec<RoutePolicy>) -> Self {
        Self { routes }
    }

    /// The route with the longest prefix matching `path`.
    pub fn resolve(&self, path: &str) -> Option<&RoutePolicy> {
        self.routes
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| r.prefix.trim_end_matches('/').len())
    }

    pub fn routes(&self) -> &[RoutePolicy] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
