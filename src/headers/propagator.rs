//! Serializes the final security context into forwarding headers.
//!
//! Header names are stable. Set-valued fields are comma-joined in sorted
//! order. Values that are not valid header text are percent-encoded.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::auth::SecurityContext;

pub static X_CLIENT_ID: HeaderName = HeaderName::from_static("x-client-id");
pub static X_CLIENT_NAME: HeaderName = HeaderName::from_static("x-client-name");
pub static X_CLIENT_ACCESS_LEVEL: HeaderName = HeaderName::from_static("x-client-access-level");
pub static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub static X_USER_NAME: HeaderName = HeaderName::from_static("x-user-name");
pub static X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub static X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");
pub static X_USER_PERMISSIONS: HeaderName = HeaderName::from_static("x-user-permissions");
pub static X_USER_ACCESS_LEVEL: HeaderName = HeaderName::from_static("x-user-access-level");
pub static X_USER_TOKEN_TYPE: HeaderName = HeaderName::from_static("x-user-token-type");
pub static X_PRINCIPAL_KIND: HeaderName = HeaderName::from_static("x-principal-kind");
pub static X_GATEWAY_REQUEST_ID: HeaderName = HeaderName::from_static("x-gateway-request-id");
pub static X_SECURITY_PIPELINE: HeaderName = HeaderName::from_static("x-security-pipeline");

/// Value of [`X_SECURITY_PIPELINE`] once every stage has passed.
pub const PIPELINE_COMPLETE: &str = "complete";

/// Write the forwarding headers for `ctx` into `headers`.
///
/// Any pre-existing header of the same name is replaced. Call only after the
/// whole pipeline has allowed the request.
pub fn propagate(ctx: &SecurityContext, headers: &mut HeaderMap) {
    set(headers, &X_GATEWAY_REQUEST_ID, ctx.request_id().as_str());

    if let Some(key) = &ctx.api_key_info {
        set(headers, &X_CLIENT_ID, key.key_id.as_str());
        set(headers, &X_CLIENT_NAME, &key.client_name);
        set(headers, &X_CLIENT_ACCESS_LEVEL, key.access_level.as_str());
    }

    if let Some(user) = &ctx.user_info {
        if let Some(user_id) = &user.user_id {
            set(headers, &X_USER_ID, user_id);
        }
        set(headers, &X_USER_NAME, &user.user_name);
        if let Some(email) = &user.email {
            set(headers, &X_USER_EMAIL, email);
        }
        set(headers, &X_USER_ROLES, &join(&user.roles));
        set(headers, &X_USER_PERMISSIONS, &join(&user.permissions));
        set(headers, &X_USER_ACCESS_LEVEL, user.access_level.as_str());
        set(headers, &X_USER_TOKEN_TYPE, user.token_type.as_str());
        set(headers, &X_PRINCIPAL_KIND, user.principal.as_str());
    }

    headers.insert(
        X_SECURITY_PIPELINE.clone(),
        HeaderValue::from_static(PIPELINE_COMPLETE),
    );
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn set(headers: &mut HeaderMap, name: &HeaderName, value: &str) {
    let plain = value.bytes().all(|b| b == b' ' || b.is_ascii_graphic());
    let header_value = if plain {
        HeaderValue::from_str(value).ok()
    } else {
        None
    };
    let header_value = header_value.unwrap_or_else(|| {
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        // Percent-encoded output is always visible ASCII.
        HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
    });
    headers.insert(name.clone(), header_value);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::auth::{ApiKeyInfo, PrincipalKind, TokenType, UserInfo};
    use crate::types::{ApiAccessLevel, KeyId, RequestId, ServiceName, UserAccessLevel};
    use http::Method;

    fn context() -> SecurityContext {
        let mut ctx = SecurityContext::with_request_id(
            RequestId::new("req-1"),
            "/orders",
            Method::GET,
            ServiceName::new("orders"),
        );
        ctx.api_key_info = Some(ApiKeyInfo {
            key_id: KeyId::new("key-1"),
            masked_key: "gk_liv****".to_string(),
            client_name: "Acme".to_string(),
            access_level: ApiAccessLevel::Premium,
            allowed_services: vec![],
            allowed_endpoints: vec![],
            expires_at: None,
        });
        ctx
    }

    #[test]
    fn test_api_key_only_context() {
        let mut headers = HeaderMap::new();
        propagate(&context(), &mut headers);

        assert_eq!(headers.get(&X_CLIENT_ID).unwrap(), "key-1");
        assert_eq!(headers.get(&X_CLIENT_NAME).unwrap(), "Acme");
        assert_eq!(headers.get(&X_CLIENT_ACCESS_LEVEL).unwrap(), "Premium");
        assert_eq!(headers.get(&X_GATEWAY_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(headers.get(&X_SECURITY_PIPELINE).unwrap(), "complete");
        assert!(headers.get(&X_USER_ID).is_none());
    }

    #[test]
    fn test_user_context() {
        let mut ctx = context();
        ctx.user_info = Some(UserInfo {
            user_id: Some("u-1".to_string()),
            user_name: "José Díaz".to_string(),
            email: Some("jose@example.com".to_string()),
            roles: BTreeSet::from(["reader".to_string(), "admin".to_string()]),
            permissions: BTreeSet::from(["orders:write".to_string(), "orders:read".to_string()]),
            access_level: UserAccessLevel::Manager,
            token_type: TokenType::Jwt,
            token_expires_at: None,
            principal: PrincipalKind::User,
        });
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("spoofed"));
        propagate(&ctx, &mut headers);

        assert_eq!(headers.get(&X_USER_ID).unwrap(), "u-1");
        assert_eq!(headers.get_all(&X_USER_ID).iter().count(), 1);
        assert_eq!(headers.get(&X_USER_NAME).unwrap(), "Jos%C3%A9+D%C3%ADaz");
        assert_eq!(headers.get(&X_USER_ROLES).unwrap(), "admin,reader");
        assert_eq!(
            headers.get(&X_USER_PERMISSIONS).unwrap(),
            "orders:read,orders:write"
        );
        assert_eq!(headers.get(&X_USER_ACCESS_LEVEL).unwrap(), "Manager");
        assert_eq!(headers.get(&X_USER_TOKEN_TYPE).unwrap(), "JWT");
        assert_eq!(headers.get(&X_PRINCIPAL_KIND).unwrap(), "user");
    }
}
