//! Credential handling and the request-scoped security model.
//!
//! Two structurally different credential types are supported:
//!
//! - **API keys**: opaque, validated by the identity service only
//! - **Principal credentials**: a bearer token, a custom token header or a
//!   session cookie. Self-contained signed tokens are verified locally
//!   against a cached public key; everything else, and anything the local
//!   check cannot accept, goes to the identity service.
//!
//! ## Security Model
//!
//! - Raw credentials live in [`Credentials`] for the duration of the
//!   pipeline only and are wrapped in [`Secret`] so they never print
//! - Every request is validated independently; no validation result is
//!   cached across requests
//! - Any error, timeout or ambiguous outcome denies the request

mod context;
mod error;
mod extractor;
pub mod key_cache;
pub mod verifier;

pub use context::{
    ApiKeyInfo, PrincipalKind, SecurityContext, SecurityDecision, StageName, TokenType, UserInfo,
};
pub use error::{Denial, DenialKind, LevelReport, Rejection};
pub use extractor::{
    CredentialConfig, Credentials, PrincipalCredential, PrincipalSource, Secret, fingerprint,
    looks_like_signed_token, mask_api_key,
};
pub use key_cache::{KeyCache, KeyCacheError, VerificationKey};
pub use verifier::{FallbackReason, TokenSettings, TokenVerifier, VerifyOutcome};
