//! Admission decision errors.
//!
//! Every rejection the pipeline can produce is a variant of [`DdosError`].
//! These are decisions, not faults: each one is deterministic given the
//! current state of the stores, and retry policy is left to the caller
//! through the `retry_after` hints.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::circuit::CircuitState;
use crate::fingerprint::Fingerprint;
use crate::rate_limit::EndpointTier;

/// Errors that can occur in `DDoS` protection operations.
#[derive(Debug, Clone, Error)]
pub enum DdosError {
    /// IP address is currently banned.
    #[error("IP {ip} is banned, retry after {}s", retry_after.as_secs())]
    Banned {
        /// The banned IP address.
        ip: IpAddr,
        /// Time remaining until the ban expires.
        retry_after: Duration,
    },

    /// The global circuit breaker is shedding load.
    #[error("service overloaded, circuit is {state}")]
    Overloaded {
        /// Circuit state at rejection time.
        state: CircuitState,
    },

    /// Per-tier rate limit exceeded.
    #[error("rate limit exceeded for {ip} on tier {tier}")]
    RateLimited {
        /// The rate-limited IP address.
        ip: IpAddr,
        /// Endpoint tier whose bucket ran dry.
        tier: EndpointTier,
        /// Sustained requests per second for the tier.
        limit: f64,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// Request fingerprint matched a blocking rule.
    #[error("request fingerprint {} from {ip} is blocked", fingerprint.short())]
    FingerprintBlocked {
        /// The IP address that sent the request.
        ip: IpAddr,
        /// The request fingerprint.
        fingerprint: Fingerprint,
    },

    /// A fingerprint shared by many sources ran out of its request budget.
    #[error("request fingerprint {} is throttled, retry after {}s", fingerprint.short(), retry_after.as_secs())]
    FingerprintThrottled {
        /// The IP address that sent the request.
        ip: IpAddr,
        /// The request fingerprint.
        fingerprint: Fingerprint,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },

    /// Connection refused at accept time.
    #[error("connection limit reached: {active}/{max}")]
    ConnectionRefused {
        /// Active connections at refusal time.
        active: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DdosError {
    /// Stable label for logs and events.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Banned { .. } => "banned",
            Self::Overloaded { .. } => "overloaded",
            Self::RateLimited { .. } => "rate-limited",
            Self::FingerprintBlocked { .. } => "fingerprint-blocked",
            Self::FingerprintThrottled { .. } => "fingerprint-throttled",
            Self::ConnectionRefused { .. } => "connection-refused",
            Self::Config(_) => "config",
        }
    }

    /// Whether this rejection counts as a violation against the caller.
    ///
    /// Bans never extend themselves and connection refusals happen before
    /// any request exists.
    #[must_use]
    pub const fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Overloaded { .. }
                | Self::RateLimited { .. }
                | Self::FingerprintBlocked { .. }
                | Self::FingerprintThrottled { .. }
        )
    }

    /// Suggested retry delay, if the rejection carries one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Banned { retry_after, .. }
            | Self::RateLimited { retry_after, .. }
            | Self::FingerprintThrottled { retry_after, .. } => Some(*retry_after),
            Self::Overloaded { .. } => Some(Duration::from_secs(5)),
            Self::FingerprintBlocked { .. } | Self::ConnectionRefused { .. } | Self::Config(_) => {
                None
            }
        }
    }
}

/// Result type for `DDoS` operations.
pub type DdosResult<T> = Result<T, DdosError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[test]
    fn test_error_display_banned() {
        let err = DdosError::Banned {
            ip: ip(),
            retry_after: Duration::from_secs(900),
        };
        let msg = err.to_string();
        assert!(msg.contains("1.2.3.4"));
        assert!(msg.contains("900s"));
        assert_eq!(err.reason(), "banned");
    }

    #[test]
    fn test_error_display_overloaded() {
        let err = DdosError::Overloaded {
            state: CircuitState::HalfOpen,
        };
        assert!(err.to_string().contains("half-open"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_error_display_rate_limited() {
        let err = DdosError::RateLimited {
            ip: ip(),
            tier: EndpointTier::Auth,
            limit: 5.0,
            retry_after: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("tier auth"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_error_display_connection_refused() {
        let err = DdosError::ConnectionRefused {
            active: 1000,
            max: 1000,
        };
        assert!(err.to_string().contains("1000/1000"));
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn test_error_display_fingerprint_throttled() {
        let err = DdosError::FingerprintThrottled {
            ip: ip(),
            fingerprint: crate::fingerprint::RequestSignature::new("Mozilla/5.0").fingerprint(),
            retry_after: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("throttled"));
        assert_eq!(err.reason(), "fingerprint-throttled");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert!(err.is_violation());
    }

    #[test]
    fn test_violation_classification() {
        assert!(!DdosError::Banned {
            ip: ip(),
            retry_after: Duration::from_secs(1),
        }
        .is_violation());
        assert!(DdosError::Overloaded {
            state: CircuitState::Open,
        }
        .is_violation());
        assert!(!DdosError::ConnectionRefused { active: 1, max: 1 }.is_violation());
        assert!(!DdosError::Config("bad".into()).is_violation());
    }
}
