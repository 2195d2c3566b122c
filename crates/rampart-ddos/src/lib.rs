//! # rampart-ddos
//!
//! Multi-layer request admission for public HTTP APIs.
//!
//! Every inbound request passes through an ordered pipeline; the first layer
//! to reject short-circuits the rest:
//!
//! 1. [`IpBlockStore`] - rejects callers banned for repeated violations
//! 2. [`CircuitBreaker`] - global load shedding, independent of the caller
//! 3. [`FingerprintTracker`] - flags one client template replayed from many IPs
//! 4. [`TieredRateLimiter`] - per-IP token buckets per endpoint tier
//!
//! [`ConnectionLimiter`] caps open transport connections at accept time,
//! outside the per-request pipeline.
//!
//! Rejections from the circuit breaker, the fingerprint tracker and the rate
//! limiter are recorded as violations against the caller; enough of them
//! within the violation window ban the IP.
//!
//! All state is in memory and local to the process. Entries expire lazily
//! and are removed by a periodic sweep ([`spawn_sweeper`]).
//!
//! # Example
//!
//! ```rust
//! use rampart_ddos::{DdosConfig, DdosProtection, RequestContext, RequestSignature};
//!
//! let protection = DdosProtection::new(DdosConfig::default()).expect("valid config");
//! let ctx = RequestContext::new(
//!     "192.0.2.10".parse().expect("ip"),
//!     "/api/auth/login",
//!     RequestSignature::new("Mozilla/5.0"),
//! );
//!
//! match protection.evaluate(&ctx) {
//!     Ok(admitted) => {
//!         // run the handler, then report how it went
//!         admitted.finish(true);
//!     }
//!     Err(rejection) => println!("rejected: {rejection}"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocklist;
pub mod circuit;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod protection;
pub mod rate_limit;
pub mod sweeper;

// Re-export main types
pub use blocklist::{IpBlockStore, ViolationOutcome};
pub use circuit::{CircuitBreaker, CircuitState, CircuitStats, Completion, InFlight};
pub use config::{
    CircuitConfig, ConnectionConfig, DdosConfig, DdosConfigBuilder, FingerprintConfig,
    IpBlockConfig, RateLimitConfig, RouteConfig, SweepConfig, TierLimit,
};
pub use connection::{ConnectionLimiter, ConnectionPermit, ConnectionStats};
pub use error::{DdosError, DdosResult};
pub use events::{BroadcastSink, EventSink, FanoutSink, ProtectionEvent, TracingSink};
pub use fingerprint::{
    Classification, Fingerprint, FingerprintStats, FingerprintTracker, FingerprintVerdict,
    FlagReason, RequestSignature,
};
pub use protection::{Admitted, DdosProtection, DdosStats, RequestContext, SweepReport};
pub use rate_limit::{EndpointTier, RateLimitStatus, TierClassifier, TieredRateLimiter, TokenBucket};
pub use sweeper::{SweeperHandle, spawn_sweeper};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::DdosConfig;
    pub use crate::error::{DdosError, DdosResult};
    pub use crate::events::{EventSink, ProtectionEvent};
    pub use crate::fingerprint::RequestSignature;
    pub use crate::protection::{Admitted, DdosProtection, RequestContext};
    pub use crate::rate_limit::EndpointTier;
    pub use crate::sweeper::spawn_sweeper;
}
