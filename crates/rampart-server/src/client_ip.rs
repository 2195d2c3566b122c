//! Client IP resolution.

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Resolve the address a request is attributed to.
///
/// With `trust_forwarded_headers`, the leftmost `X-Forwarded-For` entry wins
/// if it parses, then `X-Real-IP`. Otherwise, or when neither yields an
/// address, the socket peer is used.
pub fn resolve_client_ip(headers: &HeaderMap, peer: IpAddr, trust_forwarded_headers: bool) -> IpAddr {
    if !trust_forwarded_headers {
        return peer;
    }

    forwarded_for(headers)
        .or_else(|| real_ip(headers))
        .unwrap_or(peer)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    first.parse().ok()
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers.get("x-real-ip")?.to_str().ok()?.trim().parse().ok()
}
