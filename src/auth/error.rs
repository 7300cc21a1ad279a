//! Denial taxonomy for the security pipeline.
//!
//! Denials are expected outcomes of the pipeline, not faults. Only
//! `InternalFault` maps to a 500, and no denial ever carries exception text
//! or remote error strings back to the caller.

use std::fmt;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;

use crate::types::RequestId;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DenialKind {
    /// No key/token where one is required.
    MissingCredential,
    /// Key/token present but rejected.
    InvalidCredential,
    ExpiredCredential,
    /// Valid credential, tier too low.
    InsufficientTier,
    /// Valid principal, missing role or permission.
    InsufficientAuthorization,
    /// Identity service unreachable, failing or timed out.
    UpstreamUnavailable,
    InternalFault,
    /// No route matches the request path.
    UnknownRoute,
}

impl DenialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MissingCredential",
            Self::InvalidCredential => "InvalidCredential",
            Self::ExpiredCredential => "ExpiredCredential",
            Self::InsufficientTier => "InsufficientTier",
            Self::InsufficientAuthorization => "InsufficientAuthorization",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::InternalFault => "InternalFault",
            Self::UnknownRoute => "UnknownRoute",
        }
    }

    /// Fixed caller-facing message for this kind.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingCredential => "Authentication credential required",
            Self::InvalidCredential => "Credential rejected",
            Self::ExpiredCredential => "Credential has expired",
            Self::InsufficientTier => "Access tier too low for this endpoint",
            Self::InsufficientAuthorization => "Not authorized for this endpoint",
            Self::UpstreamUnavailable => "Credential could not be verified",
            Self::InternalFault => "Internal error",
            Self::UnknownRoute => "No service for this path",
        }
    }

    /// Expected outcomes are logged below error severity.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::UpstreamUnavailable | Self::InternalFault)
    }
}

impl fmt::Display for DenialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and required level names reported by a tier or authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelReport {
    pub current: String,
    pub required: String,
}

/// A terminal pipeline outcome.
#[derive(Debug, Clone)]
pub struct Denial {
    pub kind: DenialKind,
    pub status: StatusCode,
    /// Diagnostics for the decision log; not sent to the caller.
    pub details: String,
    pub levels: Option<LevelReport>,
}

impl Denial {
    pub fn new(kind: DenialKind, status: StatusCode, details: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            details: details.into(),
            levels: None,
        }
    }

    pub fn unauthorized(kind: DenialKind, details: impl Into<String>) -> Self {
        Self::new(kind, StatusCode::UNAUTHORIZED, details)
    }

    pub fn forbidden(kind: DenialKind, details: impl Into<String>) -> Self {
        Self::new(kind, StatusCode::FORBIDDEN, details)
    }

    /// Identity service failure. Fails closed with the stage's own status.
    pub fn upstream(status: StatusCode, details: impl Into<String>) -> Self {
        Self::new(DenialKind::UpstreamUnavailable, status, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(
            DenialKind::InternalFault,
            StatusCode::INTERNAL_SERVER_ERROR,
            details,
        )
    }

    pub fn with_levels(mut self, current: impl fmt::Display, required: impl fmt::Display) -> Self {
        self.levels = Some(LevelReport {
            current: current.to_string(),
            required: required.to_string(),
        });
        self
    }

    /// Caller-facing message. Names both levels when they are known.
    pub fn message(&self) -> String {
        match &self.levels {
            Some(levels) => format!(
                "{} (current: {}, required: {})",
                self.kind.public_message(),
                levels.current,
                levels.required
            ),
            None => self.kind.public_message().to_string(),
        }
    }

    /// Attach the request id for rendering.
    pub fn reject(self, request_id: RequestId) -> Rejection {
        Rejection {
            request_id,
            denial: self,
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status.as_u16(), self.details)
    }
}

/// A denial bound to its request, rendered as the terminal HTTP response.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub request_id: RequestId,
    pub denial: Denial,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    reason: &'static str,
    message: String,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required_level: Option<String>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let levels = self.denial.levels.clone();
        let body = RejectionBody {
            reason: self.denial.kind.as_str(),
            message: self.denial.message(),
            request_id: self.request_id.into_inner(),
            current_level: levels.as_ref().map(|l| l.current.clone()),
            required_level: levels.map(|l| l.required),
        };
        (self.denial.status, Json(body)).into_response()
    }
}
