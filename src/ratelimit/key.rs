//! Request identity derivation.
//!
//! A [`KeyResolver`] turns an inbound request into the string that partitions
//! rate-limit counters. The IP resolver walks the usual proxy headers; the
//! user resolver prefers the `id` claim of a bearer token and falls back to
//! the IP key whenever the token cannot be read.
//!
//! The user key is **not** an authenticated identity. The token signature is
//! never checked, so any client can present a payload naming any id. Use the
//! key for fairness partitioning only, never for authorization.

use std::collections::HashMap;
use std::net::IpAddr;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use tracing::trace;

/// Headers consulted for the client address, highest priority first.
const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const AUTHORIZATION: &str = "authorization";

const UNKNOWN_ADDR: &str = "unknown";

/// The parts of an inbound request the limiter looks at.
///
/// Header names are stored lowercased, so lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: HashMap<String, String>,
    remote_addr: Option<IpAddr>,
}

impl RequestContext {
    /// Create an empty request context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the transport-level peer address.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The transport-level peer address, if known.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }
}

/// Derives the counter key for a request.
pub trait KeyResolver: Send + Sync {
    /// Produce the key for `request`. Must never fail.
    fn resolve(&self, request: &RequestContext) -> String;
}

impl<F> KeyResolver for F
where
    F: Fn(&RequestContext) -> String + Send + Sync,
{
    fn resolve(&self, request: &RequestContext) -> String {
        self(request)
    }
}

/// Keys requests by client IP, as `ip:<addr>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyResolver;

impl KeyResolver for IpKeyResolver {
    fn resolve(&self, request: &RequestContext) -> String {
        format!("ip:{}", client_ip(request))
    }
}

/// Keys requests by bearer-token user id, as `user:<id>`, falling back to
/// [`IpKeyResolver`] when no usable token is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserKeyResolver;

impl KeyResolver for UserKeyResolver {
    fn resolve(&self, request: &RequestContext) -> String {
        match bearer_user_id(request) {
            Some(id) => format!("user:{}", id),
            None => IpKeyResolver.resolve(request),
        }
    }
}

/// Which built-in resolver a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    Ip,
    User,
}

impl KeyStrategy {
    /// Build the resolver for this strategy.
    pub fn resolver(&self) -> Box<dyn KeyResolver> {
        match self {
            KeyStrategy::Ip => Box::new(IpKeyResolver),
            KeyStrategy::User => Box::new(UserKeyResolver),
        }
    }
}

/// Resolve the client address from proxy headers, then the peer address.
fn client_ip(request: &RequestContext) -> String {
    let forwarded = request
        .header(X_FORWARDED_FOR)
        .and_then(|xff| xff.split(',').next());

    [
        request.header(CF_CONNECTING_IP),
        request.header(X_REAL_IP),
        forwarded,
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|value| !value.is_empty())
    .map(str::to_string)
    .or_else(|| request.remote_addr().map(|addr| addr.to_string()))
    .unwrap_or_else(|| UNKNOWN_ADDR.to_string())
}

/// Read the `id` claim out of an unverified bearer token.
///
/// Every failure mode returns `None`; the input is attacker-controlled.
fn bearer_user_id(request: &RequestContext) -> Option<String> {
    let token = request.header(AUTHORIZATION)?.strip_prefix("Bearer ")?;

    let payload = token.split('.').nth(1)?;
    let bytes = decode_segment(payload)?;

    let claims: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            trace!(error = %e, "Bearer payload is not JSON, keying by IP");
            return None;
        }
    };

    let id = match claims.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    Some(id)
}

/// Tokens in the wild use both alphabets, with and without padding.
fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| trace!(error = %e, "Bearer payload is not base64, keying by IP"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_payload(payload: &str) -> String {
        format!(
            "Bearer eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn test_cf_connecting_ip_wins() {
        let request = RequestContext::new()
            .with_header("CF-Connecting-IP", "1.1.1.1")
            .with_header("X-Real-IP", "2.2.2.2")
            .with_header("X-Forwarded-For", "3.3.3.3")
            .with_remote_addr("4.4.4.4".parse().unwrap());

        assert_eq!(IpKeyResolver.resolve(&request), "ip:1.1.1.1");
    }

    #[test]
    fn test_real_ip_before_forwarded_for() {
        let request = RequestContext::new()
            .with_header("x-real-ip", "2.2.2.2")
            .with_header("x-forwarded-for", "3.3.3.3");

        assert_eq!(IpKeyResolver.resolve(&request), "ip:2.2.2.2");
    }

    #[test]
    fn test_first_forwarded_for_entry_is_trimmed() {
        let request = RequestContext::new()
            .with_header("x-forwarded-for", "  10.0.0.7 , 172.16.0.1, 192.168.0.1");

        assert_eq!(IpKeyResolver.resolve(&request), "ip:10.0.0.7");
    }

    #[test]
    fn test_empty_headers_are_skipped() {
        let request = RequestContext::new()
            .with_header("cf-connecting-ip", "")
            .with_header("x-real-ip", "   ")
            .with_remote_addr("192.0.2.9".parse().unwrap());

        assert_eq!(IpKeyResolver.resolve(&request), "ip:192.0.2.9");
    }

    #[test]
    fn test_unknown_when_nothing_available() {
        assert_eq!(IpKeyResolver.resolve(&RequestContext::new()), "ip:unknown");
    }

    #[test]
    fn test_user_id_from_bearer_payload() {
        let request = RequestContext::new()
            .with_header("Authorization", token_with_payload(r#"{"id":"u-42","role":"admin"}"#))
            .with_remote_addr("192.0.2.1".parse().unwrap());

        assert_eq!(UserKeyResolver.resolve(&request), "user:u-42");
    }

    #[test]
    fn test_numeric_user_id() {
        let request = RequestContext::new()
            .with_header("authorization", token_with_payload(r#"{"id":1234}"#));

        assert_eq!(UserKeyResolver.resolve(&request), "user:1234");
    }

    #[test]
    fn test_padded_standard_alphabet_payload() {
        let payload = base64::engine::general_purpose::STANDARD.encode(r#"{"id":"ab"}"#);
        assert!(payload.ends_with('='));
        let request = RequestContext::new()
            .with_header("authorization", format!("Bearer h.{}.s", payload));

        assert_eq!(UserKeyResolver.resolve(&request), "user:ab");
    }

    #[test]
    fn test_malformed_token_falls_back_to_ip() {
        let request = RequestContext::new()
            .with_header("Authorization", "Bearer not-a-valid-jwt")
            .with_header("x-real-ip", "1.2.3.4");

        assert_eq!(
            UserKeyResolver.resolve(&request),
            IpKeyResolver.resolve(&request)
        );
    }

    #[test]
    fn test_fallback_cases() {
        let cases = [
            "Bearer a.!!!not base64!!!.c".to_string(),
            token_with_payload("not json at all"),
            token_with_payload(r#"{"sub":"someone"}"#),
            token_with_payload(r#"{"id":""}"#),
            token_with_payload(r#"{"id":null}"#),
            token_with_payload(r#"["id"]"#),
            "Basic dXNlcjpwYXNz".to_string(),
            "Bearer ".to_string(),
        ];

        for header in cases {
            let request = RequestContext::new()
                .with_header("authorization", header.clone())
                .with_remote_addr("198.51.100.3".parse().unwrap());
            assert_eq!(
                UserKeyResolver.resolve(&request),
                "ip:198.51.100.3",
                "header {:?} should fall back to the IP key",
                header
            );
        }
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |req: &RequestContext| {
            format!("tenant:{}", req.header("x-tenant").unwrap_or("none"))
        };
        let request = RequestContext::new().with_header("X-Tenant", "acme");

        assert_eq!(resolver.resolve(&request), "tenant:acme");
    }
}
