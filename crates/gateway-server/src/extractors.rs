//! Custom Axum extractors for the gateway.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap},
};
use gateway_resilience::RateLimitKey;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::debug;

use crate::error::ApiError;
use crate::middleware::RequestIdExt;

/// Header carrying a raw API key
pub const API_KEY_HEADER: &str = "x-api-key";
/// Legacy header carrying a raw API key
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";
/// Header carrying an already validated principal identity
pub const PRINCIPAL_HEADER: &str = "x-principal-id";
/// Header carrying the caller's permission level
pub const PERMISSION_HEADER: &str = "x-permission-level";

/// Permission level required by admin routes
pub const ADMIN_PERMISSION: &str = "admin";

/// Client address used when none can be determined
const UNKNOWN_CLIENT: &str = "unknown";

/// Request ID assigned by the request-id middleware, or taken from headers
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request_id_from_parts(parts)))
    }
}

fn request_id_from_parts(parts: &Parts) -> String {
    if let Some(ext) = parts.extensions.get::<RequestIdExt>() {
        return ext.0.clone();
    }
    parts
        .headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from)
}

/// Who is calling: the identities used for quota accounting and permissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    /// SHA-256 hex digest of the presented API key; the raw key is never kept
    pub api_key_hash: Option<String>,
    /// Principal identity established upstream
    pub principal: Option<String>,
    /// Client address
    pub client_ip: String,
    /// Permission level, if any
    pub permission: Option<String>,
}

impl CallerContext {
    /// Build the caller context from request headers and the peer address
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let api_key_hash = extract_api_key(headers).map(|key| hash_api_key(&key));
        let principal = header_str(headers, PRINCIPAL_HEADER).map(String::from);
        let permission = header_str(headers, PERMISSION_HEADER).map(str::to_lowercase);
        let client_ip = client_ip(headers)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        Self {
            api_key_hash,
            principal,
            client_ip,
            permission,
        }
    }

    /// Whether the caller holds the admin permission level
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.permission.as_deref() == Some(ADMIN_PERMISSION)
    }

    /// Primary identity: API key hash, then principal, then client address
    #[must_use]
    pub fn primary_key(&self) -> RateLimitKey {
        if let Some(hash) = &self.api_key_hash {
            RateLimitKey::ApiKeyHash(hash.clone())
        } else if let Some(principal) = &self.principal {
            RateLimitKey::Principal(principal.clone())
        } else {
            RateLimitKey::ClientIp(self.client_ip.clone())
        }
    }

    /// Keys to charge for a request on `route`
    ///
    /// Sensitive routes are charged against an extra route-class bucket
    /// scoped to the same caller.
    #[must_use]
    pub fn rate_limit_keys(&self, route: &str, sensitive: bool) -> Vec<RateLimitKey> {
        let primary = self.primary_key();
        let mut keys = Vec::with_capacity(2);
        if sensitive {
            keys.push(RateLimitKey::RouteClass {
                class: route.to_string(),
                client: primary.identity(),
            });
        }
        keys.insert(0, primary);
        keys
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(Self::from_headers(&parts.headers, peer))
    }
}

/// JSON body extractor producing the gateway error envelope on failure
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = req
            .extensions()
            .get::<RequestIdExt>()
            .map(|ext| ext.0.clone());
        let attach = |err: ApiError| match &request_id {
            Some(id) => err.with_request_id(id.clone()),
            None => err,
        };

        let bytes = axum::body::Bytes::from_request(req, state).await.map_err(|e| {
            attach(ApiError::bad_request(
                format!("Failed to read request body: {e}"),
                "invalid_body",
            ))
        })?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| {
            debug!(error = %e, "JSON parse error");
            attach(ApiError::from(e))
        })?;

        Ok(Self(value))
    }
}

/// SHA-256 hex digest of an API key
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// API key from `X-API-Key`, a bearer token, or `X-Auth-Token`, in that order
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = header_str(headers, API_KEY_HEADER) {
        return Some(key.to_string());
    }
    if let Some(token) = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        return Some(token.to_string());
    }
    header_str(headers, AUTH_TOKEN_HEADER).map(String::from)
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
        .or_else(|| header_str(headers, "x-real-ip").map(String::from))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_hash_api_key() {
        let hash = hash_api_key("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("secret"));
        assert_ne!(hash, hash_api_key("other"));
    }

    #[test]
    fn test_api_key_precedence() {
        let ctx = CallerContext::from_headers(
            &headers(&[
                ("x-api-key", "primary"),
                ("authorization", "Bearer bearer"),
                ("x-auth-token", "legacy"),
            ]),
            None,
        );
        assert_eq!(ctx.api_key_hash, Some(hash_api_key("primary")));

        let ctx = CallerContext::from_headers(
            &headers(&[("authorization", "Bearer bearer"), ("x-auth-token", "legacy")]),
            None,
        );
        assert_eq!(ctx.api_key_hash, Some(hash_api_key("bearer")));

        let ctx = CallerContext::from_headers(&headers(&[("x-auth-token", "legacy")]), None);
        assert_eq!(ctx.api_key_hash, Some(hash_api_key("legacy")));
    }

    #[test]
    fn test_client_ip_resolution() {
        let ctx = CallerContext::from_headers(
            &headers(&[
                ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
                ("x-real-ip", "10.0.0.2"),
            ]),
            None,
        );
        assert_eq!(ctx.client_ip, "203.0.113.7");

        let ctx = CallerContext::from_headers(&headers(&[("x-real-ip", "10.0.0.2")]), None);
        assert_eq!(ctx.client_ip, "10.0.0.2");

        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let ctx = CallerContext::from_headers(&HeaderMap::new(), Some(peer));
        assert_eq!(ctx.client_ip, "192.0.2.1");

        let ctx = CallerContext::from_headers(&HeaderMap::new(), None);
        assert_eq!(ctx.client_ip, "unknown");
    }

    #[test]
    fn test_primary_key_selection() {
        let anonymous = CallerContext::from_headers(&headers(&[("x-real-ip", "10.0.0.2")]), None);
        assert_eq!(
            anonymous.primary_key(),
            RateLimitKey::ClientIp("10.0.0.2".to_string())
        );

        let principal = CallerContext::from_headers(&headers(&[("x-principal-id", "svc-a")]), None);
        assert_eq!(
            principal.primary_key(),
            RateLimitKey::Principal("svc-a".to_string())
        );

        let keyed = CallerContext::from_headers(
            &headers(&[("x-api-key", "k"), ("x-principal-id", "svc-a")]),
            None,
        );
        assert_eq!(
            keyed.primary_key(),
            RateLimitKey::ApiKeyHash(hash_api_key("k"))
        );
    }

    #[test]
    fn test_sensitive_route_keys() {
        let ctx = CallerContext::from_headers(&headers(&[("x-real-ip", "10.0.0.2")]), None);

        let keys = ctx.rate_limit_keys("/predict", false);
        assert_eq!(keys.len(), 1);

        let keys = ctx.rate_limit_keys("/batch-predict", true);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], RateLimitKey::ClientIp("10.0.0.2".to_string()));
        assert_eq!(
            keys[1],
            RateLimitKey::RouteClass {
                class: "/batch-predict".to_string(),
                client: "ip:10.0.0.2".to_string(),
            }
        );
    }

    #[test]
    fn test_admin_permission() {
        let ctx = CallerContext::from_headers(&headers(&[("x-permission-level", "Admin")]), None);
        assert!(ctx.is_admin());

        let ctx = CallerContext::from_headers(&headers(&[("x-permission-level", "read")]), None);
        assert!(!ctx.is_admin());
    }
}
