//! HTTP gateway front end.
//!
//! Every request except `/healthz` is routed, run through the security
//! pipeline and, if allowed, sanitized, annotated with forwarding headers and
//! handed to the next hop. Responses pass through the outbound sanitizer.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use http::{HeaderMap, StatusCode, header};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{CredentialConfig, Credentials, Denial, DenialKind, SecurityContext};
use crate::headers::{HeaderSanitizer, propagate};
use crate::pipeline::{Pipeline, RequestScope};
use crate::routing::RouteTable;
use crate::types::RequestId;

/// Largest request body buffered for forwarding (10 MiB).
pub const MAX_FORWARD_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Connection-level headers never copied between hops.
const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// Errors raised while forwarding to a backend.
#[derive(Debug, Clone)]
pub enum ForwardError {
    /// Request body could not be read.
    Body(String),
    /// Upstream URL could not be built.
    InvalidUpstream(String),
    /// Connection or protocol failure talking to the backend.
    Transport(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(msg) => write!(f, "Failed to read request body: {}", msg),
            Self::InvalidUpstream(msg) => write!(f, "Invalid upstream: {}", msg),
            Self::Transport(msg) => write!(f, "Upstream transport error: {}", msg),
        }
    }
}

impl std::error::Error for ForwardError {}

pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, ForwardError>> + Send + 'a>>;

/// The hop after the gateway. Receives a request whose headers are already
/// sanitized and carry the forwarding context.
pub trait NextHop: Send + Sync {
    fn forward<'a>(&'a self, upstream: &'a str, request: Request) -> ForwardFuture<'a>;
}

/// Forwards requests to the route's upstream over HTTP.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, upstream: &str, request: Request) -> Result<Response, ForwardError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", upstream.trim_end_matches('/'), path_and_query);
        let url = url::Url::parse(&url).map_err(|e| ForwardError::InvalidUpstream(e.to_string()))?;

        let body = to_bytes(body, MAX_FORWARD_BODY_BYTES)
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let upstream_response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let status = upstream_response.status();
        let mut headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

impl NextHop for HttpForwarder {
    fn forward<'a>(&'a self, upstream: &'a str, request: Request) -> ForwardFuture<'a> {
        Box::pin(self.send(upstream, request))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Everything the request handler needs, shared across requests.
pub struct Gateway {
    routes: RouteTable,
    pipeline: Pipeline,
    credentials: CredentialConfig,
    sanitizer: HeaderSanitizer,
    next_hop: Arc<dyn NextHop>,
}

pub type GatewayState = Arc<Gateway>;

impl Gateway {
    pub fn new(
        routes: RouteTable,
        pipeline: Pipeline,
        credentials: CredentialConfig,
        sanitizer: HeaderSanitizer,
        next_hop: Arc<dyn NextHop>,
    ) -> Self {
        Self {
            routes,
            pipeline,
            credentials,
            sanitizer,
            next_hop,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .fallback(gateway_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(state.clone(), sanitize_outbound)),
        )
        .with_state(state)
}

pub async fn serve(state: GatewayState, bind: &str) -> Result<()> {
    let router = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(
        "Gateway listening on http://{} ({} routes)",
        bind,
        state.routes().routes().len()
    );
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn sanitize_outbound(State(state): State<GatewayState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    state.sanitizer.sanitize_response(&mut response);
    response
}

/// Error body for failures after the pipeline allowed the request.
fn gateway_error(status: StatusCode, reason: &str, message: &str, request_id: &RequestId) -> Response {
    (
        status,
        Json(serde_json::json!({
            "reason": reason,
            "message": message,
            "requestId": request_id.as_str(),
        })),
    )
        .into_response()
}

async fn gateway_handler(State(state): State<GatewayState>, request: Request) -> Response {
    let started = Instant::now();
    let path = request.uri().path().to_string();

    let Some(route) = state.routes.resolve(&path).cloned() else {
        let request_id = RequestId::generate();
        info!(%request_id, %path, "no route for path");
        return Denial::new(DenialKind::UnknownRoute, StatusCode::NOT_FOUND, "no route")
            .reject(request_id)
            .into_response();
    };

    let credentials = Credentials::extract(request.headers(), &state.credentials);
    let context = SecurityContext::new(&path, request.method().clone(), route.service.clone());
    let mut scope = RequestScope::new(context, credentials, route);

    if let Err(denial) = state.pipeline.run(&mut scope).await {
        let request_id = scope.context.request_id().clone();
        return denial.reject(request_id).into_response();
    }

    let upstream = scope.route.upstream.clone();
    let service = scope.route.service.clone();
    // Raw credentials are dropped here for good.
    let context = scope.finish();
    let request_id = context.request_id().clone();

    let (mut parts, body) = request.into_parts();
    let report = state.sanitizer.sanitize_request(&mut parts.headers);
    propagate(&context, &mut parts.headers);

    let Some(upstream) = upstream else {
        warn!(%request_id, %service, "route has no upstream configured");
        return gateway_error(
            StatusCode::BAD_GATEWAY,
            "NoUpstream",
            "No backend configured for this path",
            &request_id,
        );
    };

    match state
        .next_hop
        .forward(&upstream, Request::from_parts(parts, body))
        .await
    {
        Ok(response) => {
            info!(
                %request_id,
                %service,
                status = response.status().as_u16(),
                headers_removed = report.removed,
                headers_masked = report.masked,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request forwarded"
            );
            response
        }
        Err(e) => {
            warn!(%request_id, %service, error = %e, "forwarding failed");
            gateway_error(
                StatusCode::BAD_GATEWAY,
                "UpstreamForwardFailed",
                "Backend could not be reached",
                &request_id,
            )
        }
    }
}
