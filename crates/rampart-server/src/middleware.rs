//! Admission middleware.
//!
//! Runs every request through [`DdosProtection::evaluate`] before it reaches
//! a handler and turns rejections into HTTP responses:
//!
//! | Rejection | Status | Headers |
//! |-----------|--------|---------|
//! | Banned | 403 | `Retry-After`, `X-Block-Reason` |
//! | Overloaded | 503 | `Retry-After: 5`, `X-Circuit-State` |
//! | Fingerprint blocked | 403 | `X-Request-Fingerprint` |
//! | Fingerprint throttled | 429 | `Retry-After: 60`, `X-Request-Fingerprint` |
//! | Rate limited | 429 | `Retry-After: 1`, `X-RateLimit-*` |
//!
//! Admitted requests reach the handler unmodified. The response carries
//! `X-Request-Fingerprint` and, for limited tiers, the `X-RateLimit-*` headers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rampart_ddos::{DdosError, DdosProtection, EndpointTier, RequestContext, RequestSignature};
use tracing::warn;

use crate::client_ip::resolve_client_ip;
use crate::error::ErrorBody;

/// `Retry-After`.
pub const RETRY_AFTER: HeaderName = HeaderName::from_static("retry-after");
/// Why a banned caller was blocked.
pub const X_BLOCK_REASON: HeaderName = HeaderName::from_static("x-block-reason");
/// Circuit state on overload rejections.
pub const X_CIRCUIT_STATE: HeaderName = HeaderName::from_static("x-circuit-state");
/// Short request fingerprint.
pub const X_REQUEST_FINGERPRINT: HeaderName = HeaderName::from_static("x-request-fingerprint");
/// Sustained requests per second for the tier.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Whole tokens left in the caller's bucket.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Tier the request was limited under.
pub const X_RATELIMIT_TIER: HeaderName = HeaderName::from_static("x-ratelimit-tier");
/// Unix time by which at least one token has refilled.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const BLOCK_REASON_VIOLATIONS: &str = "rate-limit-violation";

/// State shared with the middleware.
#[derive(Debug, Clone)]
pub struct ProtectionState {
    /// The admission pipeline.
    pub protection: Arc<DdosProtection>,
    /// Resolve the client from forwarding headers.
    pub trust_forwarded_headers: bool,
}

impl ProtectionState {
    /// Create middleware state.
    pub fn new(protection: Arc<DdosProtection>, trust_forwarded_headers: bool) -> Self {
        Self {
            protection,
            trust_forwarded_headers,
        }
    }
}

/// Admission middleware, for use with `axum::middleware::from_fn_with_state`.
pub async fn protect(
    State(state): State<ProtectionState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer_ip(&request);
    let ip = resolve_client_ip(request.headers(), peer, state.trust_forwarded_headers);
    let signature = signature(request.headers());
    let ctx = RequestContext::new(ip, request.uri().path(), signature);

    let admitted = match state.protection.evaluate(&ctx) {
        Ok(admitted) => admitted,
        Err(rejection) => return rejection_response(&rejection),
    };

    let mut response = next.run(request).await;
    let success = !response.status().is_server_error();

    let headers = response.headers_mut();
    insert(headers, X_REQUEST_FINGERPRINT, admitted.fingerprint.short());
    if let Some(rate) = admitted.rate {
        insert_rate_headers(headers, rate.tier, rate.limit, rate.remaining);
    }

    admitted.finish(success);
    response
}

fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| addr.ip())
}

fn signature(headers: &HeaderMap) -> RequestSignature {
    RequestSignature::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
    )
}

/// Build the HTTP response for a rejection.
pub fn rejection_response(rejection: &DdosError) -> Response {
    let (status, error) = match rejection {
        DdosError::Banned { .. } => (StatusCode::FORBIDDEN, "banned"),
        DdosError::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        DdosError::FingerprintBlocked { .. } => (StatusCode::FORBIDDEN, "forbidden"),
        DdosError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        DdosError::FingerprintThrottled { .. } => (StatusCode::TOO_MANY_REQUESTS, "throttled"),
        DdosError::ConnectionRefused { .. } | DdosError::Config(_) => {
            warn!(error = %rejection, "Unexpected admission error");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    let body = ErrorBody {
        error,
        message: rejection.to_string(),
    };
    let mut response = (status, [("content-type", "application/json")], body.to_json()).into_response();
    let headers = response.headers_mut();

    match rejection {
        DdosError::Banned { retry_after, .. } => {
            insert(headers, RETRY_AFTER, &ceil_secs(*retry_after).to_string());
            insert(headers, X_BLOCK_REASON, BLOCK_REASON_VIOLATIONS);
        }
        DdosError::Overloaded { state } => {
            let secs = rejection.retry_after().map_or(5, ceil_secs);
            insert(headers, RETRY_AFTER, &secs.to_string());
            insert(headers, X_CIRCUIT_STATE, state.as_str());
        }
        DdosError::FingerprintBlocked { fingerprint, .. } => {
            insert(headers, X_REQUEST_FINGERPRINT, fingerprint.short());
        }
        DdosError::FingerprintThrottled {
            fingerprint,
            retry_after,
            ..
        } => {
            insert(headers, RETRY_AFTER, &ceil_secs(*retry_after).to_string());
            insert(headers, X_REQUEST_FINGERPRINT, fingerprint.short());
        }
        DdosError::RateLimited {
            tier,
            limit,
            retry_after,
            ..
        } => {
            insert(headers, RETRY_AFTER, &ceil_secs(*retry_after).to_string());
            insert_rate_headers(headers, *tier, *limit, 0);
        }
        DdosError::ConnectionRefused { .. } | DdosError::Config(_) => {}
    }

    response
}

fn insert_rate_headers(headers: &mut HeaderMap, tier: EndpointTier, limit: f64, remaining: u32) {
    let reset = Utc::now().timestamp() + 1;
    insert(headers, X_RATELIMIT_LIMIT, &format!("{limit:.0}"));
    insert(headers, X_RATELIMIT_REMAINING, &remaining.to_string());
    insert(headers, X_RATELIMIT_TIER, tier.as_str());
    insert(headers, X_RATELIMIT_RESET, &reset.to_string());
}

/// Whole seconds, rounded up, never below one.
fn ceil_secs(duration: std::time::Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use rampart_ddos::{CircuitConfig, DdosConfig, FingerprintConfig, TierLimit};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(config: DdosConfig) -> (Router, Arc<DdosProtection>) {
        let protection = Arc::new(DdosProtection::new(config).unwrap());
        let state = ProtectionState::new(Arc::clone(&protection), true);
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/users", get(|| async { "users" }))
            .route("/api/auth/login", get(|| async { "token" }))
            .route(
                "/api/fail",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            )
            .layer(axum::middleware::from_fn_with_state(state, protect));
        (router, protection)
    }

    fn get_from(path: &str, ip: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .header("user-agent", "Mozilla/5.0")
            .header("accept", "text/html")
            .body(Body::empty())
            .unwrap()
    }

    fn header<'a>(response: &'a Response, name: &HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_admitted_request_gets_fingerprint_and_rate_headers() {
        let (app, _) = app(DdosConfig::default());

        let response = app.oneshot(get_from("/api/users", "203.0.113.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_REQUEST_FINGERPRINT).map(str::len), Some(8));
        assert_eq!(header(&response, &X_RATELIMIT_TIER), Some("standard"));
        assert!(header(&response, &X_RATELIMIT_LIMIT).is_some());
        assert!(header(&response, &X_RATELIMIT_RESET).is_some());
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let (app, _) = app(DdosConfig::default());

        let response = app.oneshot(get_from("/health", "203.0.113.2")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, &X_REQUEST_FINGERPRINT).is_some());
        assert!(header(&response, &X_RATELIMIT_TIER).is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let config = DdosConfig::builder()
            .tier(EndpointTier::Auth, TierLimit::new(1.0, 1))
            .build();
        let (app, _) = app(config);

        let first = app.clone().oneshot(get_from("/api/auth/login", "203.0.113.3")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header(&first, &X_RATELIMIT_REMAINING), Some("0"));

        let second = app.oneshot(get_from("/api/auth/login", "203.0.113.3")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&second, &RETRY_AFTER), Some("1"));
        assert_eq!(header(&second, &X_RATELIMIT_LIMIT), Some("1"));
        assert_eq!(header(&second, &X_RATELIMIT_REMAINING), Some("0"));
        assert_eq!(header(&second, &X_RATELIMIT_TIER), Some("auth"));
    }

    #[tokio::test]
    async fn test_banned_response() {
        let (app, protection) = app(DdosConfig::default());
        let ip: IpAddr = "203.0.113.4".parse().unwrap();
        protection.ban(ip, Some(Duration::from_secs(90)));

        let response = app.oneshot(get_from("/api/users", "203.0.113.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(header(&response, &X_BLOCK_REASON), Some("rate-limit-violation"));
        let retry: u64 = header(&response, &RETRY_AFTER).unwrap().parse().unwrap();
        assert!((1..=90).contains(&retry));
    }

    #[tokio::test]
    async fn test_suspicious_agent_blocked() {
        let config = DdosConfig::builder()
            .fingerprint(FingerprintConfig {
                block_suspicious_agents: true,
                ..FingerprintConfig::default()
            })
            .build();
        let (app, _) = app(config);

        let request = HttpRequest::builder()
            .uri("/api/users")
            .header("x-forwarded-for", "203.0.113.5")
            .header("user-agent", "sqlmap/1.7")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(header(&response, &X_REQUEST_FINGERPRINT).map(str::len), Some(8));
        assert!(header(&response, &X_BLOCK_REASON).is_none());
    }

    #[tokio::test]
    async fn test_throttled_fingerprint_response() {
        let config = DdosConfig::builder()
            .fingerprint(FingerprintConfig {
                max_requests: 20,
                suspicious_threshold: 1,
                throttle_distributed: true,
                ..FingerprintConfig::default()
            })
            .build();
        let (app, _) = app(config);

        // One source, then a burst of two for the distributed fingerprint.
        for i in 0..3 {
            let ip = format!("203.0.113.{}", 20 + i);
            let response = app.clone().oneshot(get_from("/api/users", &ip)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{ip}");
        }

        let response = app.oneshot(get_from("/api/users", "203.0.113.23")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, &RETRY_AFTER), Some("60"));
        assert_eq!(header(&response, &X_REQUEST_FINGERPRINT).map(str::len), Some(8));
        assert!(header(&response, &X_RATELIMIT_TIER).is_none());
    }

    #[tokio::test]
    async fn test_circuit_sheds_load_once_tripped() {
        let config = DdosConfig::builder()
            .circuit(CircuitConfig {
                max_rps: 2,
                ..CircuitConfig::default()
            })
            .build();
        let (app, protection) = app(config);

        let mut statuses = Vec::new();
        for i in 0..4 {
            let ip = format!("203.0.113.{}", 10 + i);
            let response = app.clone().oneshot(get_from("/api/users", &ip)).await.unwrap();
            statuses.push(response.status());
            if response.status() == StatusCode::SERVICE_UNAVAILABLE {
                assert_eq!(header(&response, &RETRY_AFTER), Some("5"));
                assert_eq!(header(&response, &X_CIRCUIT_STATE), Some("open"));
            }
        }

        assert!(statuses.contains(&StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(protection.circuit().state(), rampart_ddos::CircuitState::Open);
    }

    #[tokio::test]
    async fn test_server_error_completes_request() {
        let (app, protection) = app(DdosConfig::default());

        let response = app.oneshot(get_from("/api/fail", "203.0.113.6")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(protection.circuit().concurrent(), 0);
    }

    #[tokio::test]
    async fn test_untrusted_headers_fall_back_to_peer() {
        let protection = Arc::new(DdosProtection::with_defaults());
        let state = ProtectionState::new(Arc::clone(&protection), false);
        let app = Router::new()
            .route("/api/users", get(|| async { "users" }))
            .layer(axum::middleware::from_fn_with_state(state, protect));

        let spoofed: IpAddr = "203.0.113.7".parse().unwrap();
        protection.ban(spoofed, None);

        let mut request = get_from("/api/users", "203.0.113.7");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))));
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(900)), 900);
    }

    #[test]
    fn test_overloaded_half_open_header() {
        let response = rejection_response(&DdosError::Overloaded {
            state: rampart_ddos::CircuitState::HalfOpen,
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header(&response, &X_CIRCUIT_STATE), Some("half-open"));
    }
}
