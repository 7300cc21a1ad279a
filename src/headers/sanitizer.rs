//! Inbound and outbound header sanitization.
//!
//! Every header is classified as remove, mask or pass-through by matching its
//! name against glob lists. Inbound values are additionally scanned for
//! sensitive-looking substrings, which are masked in place. Masking keeps the
//! first and last two characters, so a second pass over sanitized headers
//! changes nothing.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::CredentialConfig;

/// Marker extension for responses whose headers have already been written.
///
/// Outbound sanitization leaves such responses untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadersCommitted;

/// Glob lists for both directions. `*` matches any run of characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub inbound_remove: Vec<String>,
    pub inbound_mask: Vec<String>,
    pub outbound_remove: Vec<String>,
    pub outbound_mask: Vec<String>,
    /// Mask sensitive-looking substrings in inbound values
    pub scan_values: bool,
}

fn globs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            inbound_remove: globs(&[
                "authorization",
                "proxy-authorization",
                "cookie",
                "x-api-key",
                "x-forwarded-*",
                "forwarded",
                "x-user-*",
                "x-client-*",
                "x-security-*",
                "x-internal-*",
                "x-gateway-*",
                "x-principal-*",
            ]),
            inbound_mask: globs(&["x-session-id", "x-device-id", "x-real-ip"]),
            outbound_remove: globs(&[
                "x-service-*",
                "x-user-*",
                "x-client-*",
                "x-internal-*",
                "x-security-*",
                "x-principal-*",
                "x-gateway-*",
                "server",
                "x-powered-by",
                "x-aspnet-version",
                "x-aspnetmvc-version",
                "x-runtime",
            ]),
            outbound_mask: globs(&["x-request-id", "x-correlation-id"]),
            scan_values: true,
        }
    }
}

/// Headers that can carry a principal credential.
const ALWAYS_REMOVED_INBOUND: &[&str] = &["authorization", "proxy-authorization", "cookie"];

/// Generic patterns for secrets that show up in otherwise harmless headers.
const SENSITIVE_VALUE_PATTERNS: &[&str] = &[
    r"(?i)bearer\s+\S+",
    r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    r"[A-Za-z0-9+/]{40,}={0,2}",
    r"[A-Za-z0-9_\-]{32,}",
];

/// Mask a value as `first2 + '*' * (len - 4) + last2`, or `***` when it is
/// four characters or shorter.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let mut masked = String::with_capacity(chars.len());
    masked.extend(&chars[..2]);
    masked.extend(std::iter::repeat_n('*', chars.len() - 4));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}

/// Counts of what one pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub removed: usize,
    pub masked: usize,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.removed == 0 && self.masked == 0
    }
}

#[derive(Debug, Clone)]
struct GlobSet(Vec<Regex>);

impl GlobSet {
    fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        patterns
            .iter()
            .map(|p| glob_to_regex(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    fn matches(&self, name: &str) -> bool {
        self.0.iter().any(|re| re.is_match(name))
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .trim()
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Remove,
    Mask,
    Pass,
}

#[derive(Debug, Clone)]
struct Rules {
    remove: GlobSet,
    mask: GlobSet,
}

impl Rules {
    fn classify(&self, name: &HeaderName) -> Action {
        if self.remove.matches(name.as_str()) {
            Action::Remove
        } else if self.mask.matches(name.as_str()) {
            Action::Mask
        } else {
            Action::Pass
        }
    }
}

/// Compiled sanitizer for both directions.
#[derive(Debug, Clone)]
pub struct HeaderSanitizer {
    inbound: Rules,
    outbound: Rules,
    sensitive: Option<Vec<Regex>>,
}

impl HeaderSanitizer {
    /// Compile the glob lists. Credential-carrying headers are always removed
    /// inbound, whatever the lists say.
    pub fn new(config: &SanitizerConfig, credentials: &CredentialConfig) -> Result<Self, regex::Error> {
        let mut inbound_remove = config.inbound_remove.clone();
        inbound_remove.extend(ALWAYS_REMOVED_INBOUND.iter().map(|h| h.to_string()));
        inbound_remove.push(credentials.api_key_header.clone());
        inbound_remove.push(credentials.token_header.clone());

        let sensitive = if config.scan_values {
            Some(
                SENSITIVE_VALUE_PATTERNS
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };

        Ok(Self {
            inbound: Rules {
                remove: GlobSet::compile(&inbound_remove)?,
                mask: GlobSet::compile(&config.inbound_mask)?,
            },
            outbound: Rules {
                remove: GlobSet::compile(&config.outbound_remove)?,
                mask: GlobSet::compile(&config.outbound_mask)?,
            },
            sensitive,
        })
    }

    /// Sanitize headers about to be forwarded downstream.
    pub fn sanitize_request(&self, headers: &mut HeaderMap) -> SanitizeReport {
        apply(&self.inbound, self.sensitive.as_deref(), headers)
    }

    /// Sanitize headers about to be returned to the caller.
    pub fn sanitize_response_headers(&self, headers: &mut HeaderMap) -> SanitizeReport {
        apply(&self.outbound, None, headers)
    }

    /// Sanitize a response unless its headers are already committed.
    ///
    /// Returns `None` when the response was left untouched.
    pub fn sanitize_response<B>(&self, response: &mut Response<B>) -> Option<SanitizeReport> {
        if response.status() == StatusCode::SWITCHING_PROTOCOLS
            || response.extensions().get::<HeadersCommitted>().is_some()
        {
            debug!(status = response.status().as_u16(), "response headers already committed, outbound sanitization skipped");
            return None;
        }
        Some(self.sanitize_response_headers(response.headers_mut()))
    }
}

fn apply(rules: &Rules, sensitive: Option<&[Regex]>, headers: &mut HeaderMap) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    let original = std::mem::take(headers);
    let mut current: Option<HeaderName> = None;

    for (name, value) in original {
        // `None` means "same name as the previous entry".
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.clone() else {
            continue;
        };

        match rules.classify(&name) {
            Action::Remove => report.removed += 1,
            Action::Mask => {
                let masked = masked_header(&mask_value(&lossy(&value)));
                if masked != value {
                    report.masked += 1;
                }
                headers.append(name, masked);
            }
            Action::Pass => {
                let value = match sensitive {
                    Some(patterns) => match scan(patterns, &lossy(&value)) {
                        Some(scrubbed) => {
                            report.masked += 1;
                            masked_header(&scrubbed)
                        }
                        None => value,
                    },
                    None => value,
                };
                headers.append(name, value);
            }
        }
    }
    report
}

/// Mask every sensitive match. `None` if nothing matched.
fn scan(patterns: &[Regex], value: &str) -> Option<String> {
    let mut out = value.to_string();
    let mut changed = false;
    for re in patterns {
        if re.is_match(&out) {
            out = re
                .replace_all(&out, |caps: &regex::Captures| mask_value(&caps[0]))
                .into_owned();
            changed = true;
        }
    }
    changed.then_some(out)
}

fn lossy(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn masked_header(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("***"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> HeaderSanitizer {
        HeaderSanitizer::new(&SanitizerConfig::default(), &CredentialConfig::default()).unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_mask_value() {
        assert_eq!(mask_value("abcdef"), "ab**ef");
        assert_eq!(mask_value("abcd"), "***");
        assert_eq!(mask_value(""), "***");
        assert_eq!(mask_value(&mask_value("192.168.10.20")), mask_value("192.168.10.20"));
    }

    #[test]
    fn test_inbound_removes_credentials_and_spoofed_context() {
        let mut map = headers(&[
            ("x-api-key", "gk_live_123"),
            ("authorization", "Bearer abc"),
            ("cookie", "session=xyz"),
            ("x-auth-token", "opaque"),
            ("x-forwarded-for", "10.0.0.1"),
            ("x-user-id", "admin"),
            ("x-security-pipeline", "complete"),
            ("accept", "application/json"),
        ]);
        let report = sanitizer().sanitize_request(&mut map);

        assert_eq!(report.removed, 7);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_credential_headers_removed_with_custom_remove_list() {
        let config = SanitizerConfig {
            inbound_remove: vec!["x-debug-*".to_string()],
            ..Default::default()
        };
        let sanitizer = HeaderSanitizer::new(&config, &CredentialConfig::default()).unwrap();
        let mut map = headers(&[
            ("authorization", "Bearer abc"),
            ("proxy-authorization", "Basic dXNlcjpwYXNz"),
            ("cookie", "session=xyz"),
            ("x-api-key", "gk_live_123"),
            ("x-auth-token", "opaque"),
            ("accept", "application/json"),
        ]);
        let report = sanitizer.sanitize_request(&mut map);

        assert_eq!(report.removed, 5);
        assert_eq!(map.len(), 1);
        assert!(map.get("accept").is_some());
    }

    #[test]
    fn test_inbound_masks_identifiers() {
        let mut map = headers(&[("x-real-ip", "203.0.113.42"), ("x-device-id", "dev1")]);
        let report = sanitizer().sanitize_request(&mut map);

        assert_eq!(report.masked, 2);
        assert_eq!(map.get("x-real-ip").unwrap(), "20********42");
        assert_eq!(map.get("x-device-id").unwrap(), "***");
    }

    #[test]
    fn test_sensitive_values_masked_on_unclassified_headers() {
        let token = "a".repeat(20) + &"B".repeat(20);
        let mut map = headers(&[
            ("x-trace", "550e8400-e29b-41d4-a716-446655440000"),
            ("x-note", &format!("ref {}", token)),
            ("x-debug", "bearer sk_test_1"),
            ("user-agent", "curl/8.5.0"),
        ]);
        let report = sanitizer().sanitize_request(&mut map);

        assert_eq!(report.masked, 3);
        assert_eq!(
            map.get("x-trace").unwrap(),
            "55********************************00"
        );
        let note = map.get("x-note").unwrap().to_str().unwrap();
        assert!(note.starts_with("ref aa"));
        assert!(!note.contains(&token));
        assert!(!map.get("x-debug").unwrap().to_str().unwrap().contains("sk_test_1"));
        assert_eq!(map.get("user-agent").unwrap(), "curl/8.5.0");
    }

    #[test]
    fn test_inbound_is_idempotent() {
        let sanitizer = sanitizer();
        let mut map = headers(&[
            ("x-api-key", "gk_live_123"),
            ("x-session-id", "s-0123456789"),
            ("x-trace", "550e8400-e29b-41d4-a716-446655440000"),
            ("x-blob", "QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWZnaGlqa2xt"),
            ("x-debug", "Bearer zzz"),
            ("accept", "text/html"),
            ("accept", "application/json"),
        ]);
        sanitizer.sanitize_request(&mut map);
        let once = map.clone();

        let report = sanitizer.sanitize_request(&mut map);
        assert!(report.is_clean());
        assert_eq!(map, once);
        assert_eq!(map.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_outbound_strips_internal_headers() {
        let mut map = headers(&[
            ("x-service-version", "orders-7"),
            ("x-user-id", "u-1"),
            ("x-internal-shard", "3"),
            ("server", "nginx/1.25"),
            ("x-powered-by", "Express"),
            ("x-request-id", "req-123456"),
            ("content-type", "application/json"),
        ]);
        let report = sanitizer().sanitize_response_headers(&mut map);

        assert_eq!(report.removed, 5);
        assert_eq!(report.masked, 1);
        assert_eq!(map.get("x-request-id").unwrap(), "re******56");
        assert_eq!(map.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_committed_response_left_untouched() {
        let sanitizer = sanitizer();

        let mut upgraded = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("server", "backend")
            .body(())
            .unwrap();
        assert!(sanitizer.sanitize_response(&mut upgraded).is_none());
        assert!(upgraded.headers().contains_key("server"));

        let mut committed = Response::builder()
            .header("x-user-id", "u-1")
            .extension(HeadersCommitted)
            .body(())
            .unwrap();
        assert!(sanitizer.sanitize_response(&mut committed).is_none());
        assert!(committed.headers().contains_key("x-user-id"));

        let mut normal = Response::builder().header("x-user-id", "u-1").body(()).unwrap();
        assert_eq!(sanitizer.sanitize_response(&mut normal).unwrap().removed, 1);
    }

    #[test]
    fn test_glob_matching() {
        let set = GlobSet::compile(&["x-forwarded-*", "server"][..]).unwrap();
        assert!(set.matches("x-forwarded-for"));
        assert!(set.matches("X-Forwarded-Proto"));
        assert!(set.matches("server"));
        assert!(!set.matches("x-server"));
        assert!(!set.matches("x-forwarded"));
    }
}
