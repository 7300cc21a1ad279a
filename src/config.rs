use anyhow::Context;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, path::Path, path::PathBuf};

use crate::auth::key_cache::{DEFAULT_MIN_REFRESH_INTERVAL_SECONDS, DEFAULT_REFRESH_INTERVAL_SECONDS};
use crate::auth::verifier::DEFAULT_CLOCK_SKEW_SECONDS;
use crate::auth::{CredentialConfig, TokenSettings};
use crate::headers::SanitizerConfig;
use crate::pipeline::DEFAULT_STAGE_TIMEOUT_MS;
use crate::routing::{RoutePolicy, RouteTable};

pub const CONFIG_ENV: &str = "GATEWAY_CONFIG";
pub const CONFIG_FILE_NAME: &str = "gateway.json";

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub routes: Vec<RoutePolicy>,
}

fn default_identity_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub base_url: String,
    #[serde(default = "default_identity_timeout_ms")]
    pub timeout_ms: u64,
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Used when the verification key response does not name its algorithm
    pub algorithm: String,
    pub clock_skew_secs: u64,
    pub refresh_interval_secs: u64,
    pub min_refresh_interval_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            algorithm: "RS256".to_string(),
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECONDS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECONDS,
            min_refresh_interval_secs: DEFAULT_MIN_REFRESH_INTERVAL_SECONDS,
        }
    }
}

impl TokenConfig {
    pub fn settings(&self) -> TokenSettings {
        TokenSettings {
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
            clock_skew_secs: self.clock_skew_secs,
        }
    }

    pub fn algorithm(&self) -> anyhow::Result<Algorithm> {
        Algorithm::from_str(&self.algorithm)
            .map_err(|_| anyhow::anyhow!("Unknown token algorithm `{}`", self.algorithm))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stage_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

impl GatewayConfig {
    /// Parse, expand `${VAR}` references and validate.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: GatewayConfig = serde_json::from_str(raw)?;
        let cfg = cfg.expand();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.routes.clone())
    }

    fn expand(mut self) -> Self {
        self.listen = expand_env_vars(&self.listen);
        self.identity.base_url = expand_env_vars(&self.identity.base_url);
        if let Some(issuer) = self.tokens.issuer.as_mut() {
            *issuer = expand_env_vars(issuer);
        }
        if let Some(audience) = self.tokens.audience.as_mut() {
            *audience = expand_env_vars(audience);
        }
        for route in &mut self.routes {
            if let Some(upstream) = route.upstream.as_mut() {
                *upstream = expand_env_vars(upstream);
            }
        }
        self
    }

    fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.identity.base_url)
            .with_context(|| format!("identity.base_url `{}` is not a URL", self.identity.base_url))?;
        self.tokens.algorithm()?;

        if self.identity.timeout_ms == 0 || self.pipeline.stage_timeout_ms == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        let mut prefixes = BTreeSet::new();
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                anyhow::bail!("Route prefix `{}` must start with `/`", route.prefix);
            }
            if !prefixes.insert(route.prefix.trim_end_matches('/').to_string()) {
                anyhow::bail!("Route prefix `{}` is declared twice", route.prefix);
            }
            if route.authorize_principal && !route.authenticate_principal {
                anyhow::bail!(
                    "Route `{}` authorizes principals but does not authenticate them",
                    route.prefix
                );
            }
            if let Some(upstream) = &route.upstream {
                url::Url::parse(upstream).with_context(|| {
                    format!("Route `{}` upstream `{}` is not a URL", route.prefix, upstream)
                })?;
            }
        }
        Ok(())
    }
}

/// Locate the config file: explicit path, `GATEWAY_CONFIG`,
/// `$XDG_CONFIG_HOME/gateway-guard/gateway.json`, then `./gateway.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    if let Ok(p) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("gateway-guard")
            .join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from(CONFIG_FILE_NAME);
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find {} (set {} or create ./{})",
        CONFIG_FILE_NAME,
        CONFIG_ENV,
        CONFIG_FILE_NAME
    ))
}

pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    GatewayConfig::from_json_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

/// Replace `${NAME}` with the value of the environment variable. Unset
/// variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{ "identity": { "base_url": "http://identity.local:9000" } }"#;

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.identity.timeout_ms, 2000);
        assert_eq!(cfg.tokens.algorithm().unwrap(), Algorithm::RS256);
        assert_eq!(cfg.tokens.clock_skew_secs, 300);
        assert_eq!(cfg.credentials.api_key_header, "X-API-Key");
        assert_eq!(cfg.pipeline.stage_timeout(), Duration::from_millis(3000));
        assert!(cfg.sanitizer.scan_values);
        assert!(cfg.routes.is_empty());
    }

    #[test]
    fn test_full_config() {
        let raw = r#"{
            "listen": "127.0.0.1:9090",
            "identity": { "base_url": "https://identity.example.com/api/", "timeout_ms": 750 },
            "tokens": { "issuer": "https://identity.example.com", "audience": "gateway", "algorithm": "ES256" },
            "credentials": { "token_header": "X-Acme-Token" },
            "routes": [
                { "prefix": "/orders", "service": "orders", "upstream": "http://orders:8080" },
                { "prefix": "/orders/admin", "service": "orders", "authenticate_principal": true, "authorize_principal": true }
            ]
        }"#;
        let cfg = GatewayConfig::from_json_str(raw).unwrap();
        assert_eq!(cfg.identity.timeout(), Duration::from_millis(750));
        assert_eq!(cfg.tokens.algorithm().unwrap(), Algorithm::ES256);
        assert_eq!(cfg.tokens.settings().audience.as_deref(), Some("gateway"));
        assert_eq!(cfg.credentials.token_header, "X-Acme-Token");
        assert_eq!(cfg.credentials.session_cookie, "session");

        let table = cfg.route_table();
        let route = table.resolve("/orders/admin/users").unwrap();
        assert!(route.authorize_principal);
        assert!(route.require_api_key);
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let err = GatewayConfig::from_json_str(r#"{ "identity": { "base_url": "not a url" } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("identity.base_url"));
    }

    #[test]
    fn test_rejects_authorize_without_authenticate() {
        let raw = r#"{
            "identity": { "base_url": "http://identity" },
            "routes": [{ "prefix": "/admin", "service": "admin", "authorize_principal": true }]
        }"#;
        assert!(GatewayConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn test_rejects_duplicate_prefix() {
        let raw = r#"{
            "identity": { "base_url": "http://identity" },
            "routes": [
                { "prefix": "/orders", "service": "a" },
                { "prefix": "/orders/", "service": "b" }
            ]
        }"#;
        let err = GatewayConfig::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let raw = r#"{
            "identity": { "base_url": "http://identity" },
            "tokens": { "algorithm": "ROT13" }
        }"#;
        assert!(GatewayConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: test-only env mutation with a unique variable name.
        unsafe { env::set_var("GATEWAY_GUARD_TEST_IDENTITY_HOST", "identity.internal") };
        let raw = r#"{
            "identity": { "base_url": "http://${GATEWAY_GUARD_TEST_IDENTITY_HOST}:9000" },
            "tokens": { "issuer": "${GATEWAY_GUARD_TEST_UNSET_VAR}" }
        }"#;
        let cfg = GatewayConfig::from_json_str(raw).unwrap();
        assert_eq!(cfg.identity.base_url, "http://identity.internal:9000");
        assert_eq!(
            cfg.tokens.issuer.as_deref(),
            Some("${GATEWAY_GUARD_TEST_UNSET_VAR}")
        );

        assert_eq!(
            expand_env_vars("http://${GATEWAY_GUARD_TEST_IDENTITY_HOST}:9000"),
            "http://identity.internal:9000"
        );
        assert_eq!(expand_env_vars("${GATEWAY_GUARD_TEST_UNSET_VAR}"), "${GATEWAY_GUARD_TEST_UNSET_VAR}");
        assert_eq!(expand_env_vars("plain $value"), "plain $value");
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.identity.base_url, "http://identity.local:9000");
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_resolve_explicit_path_wins() {
        let path = PathBuf::from("/etc/gateway-guard/custom.json");
        assert_eq!(resolve_config_path(Some(&path)).unwrap(), path);
    }
}
