//! `DDoS` protection configuration.
//!
//! All values are fixed at process start. Time values are stored in the
//! units operators configure them in (`*_minutes`, `*_secs`) and exposed as
//! [`Duration`]s through accessor methods.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DdosError, DdosResult};
use crate::rate_limit::EndpointTier;

/// Default cap on entries held by each keyed store.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Longest accepted value for any configured duration (100 years).
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Configuration for the IP block store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpBlockConfig {
    /// Violations within the window that trigger a ban.
    pub max_violations: u32,
    /// How long a ban lasts, in minutes.
    pub block_duration_minutes: u64,
    /// Window over which violations are counted, in minutes.
    pub violation_window_minutes: u64,
    /// Maximum number of tracked IPs.
    pub max_entries: usize,
}

impl Default for IpBlockConfig {
    fn default() -> Self {
        Self {
            max_violations: 10,
            block_duration_minutes: 15,
            violation_window_minutes: 5,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl IpBlockConfig {
    /// Ban duration.
    #[must_use]
    pub const fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_minutes.saturating_mul(60))
    }

    /// Violation counting window.
    #[must_use]
    pub const fn violation_window(&self) -> Duration {
        Duration::from_secs(self.violation_window_minutes.saturating_mul(60))
    }
}

/// Configuration for the global circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Maximum in-flight requests before the circuit opens.
    pub max_concurrent: u64,
    /// Maximum admitted requests per second before the circuit opens.
    pub max_rps: u64,
    /// How long the circuit stays open before trial requests, in seconds.
    pub open_timeout_secs: u64,
    /// Trial requests allowed in flight while half-open.
    pub half_open_max_trials: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            max_rps: 500,
            open_timeout_secs: 30,
            half_open_max_trials: 5,
        }
    }
}

impl CircuitConfig {
    /// Open-state timeout.
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// Configuration for transport-level connection admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum simultaneously open connections.
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Token bucket parameters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Sustained requests per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl TierLimit {
    /// Create a tier limit.
    #[must_use]
    pub const fn new(rps: f64, burst: u32) -> Self {
        Self { rps, burst }
    }
}

/// A path-to-tier routing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path or path prefix.
    pub prefix: String,
    /// Tier assigned to matching paths.
    pub tier: EndpointTier,
}

impl RouteConfig {
    /// Create a route entry.
    #[must_use]
    pub fn new(prefix: impl Into<String>, tier: EndpointTier) -> Self {
        Self {
            prefix: prefix.into(),
            tier,
        }
    }
}

/// Configuration for tiered rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Authentication endpoints.
    pub auth: TierLimit,
    /// Everything not otherwise classified.
    pub standard: TierLimit,
    /// Computationally costly operations.
    pub expensive: TierLimit,
    /// Trusted third-party callbacks.
    pub webhook: TierLimit,
    /// Path routing table. Exact matches win, then the longest prefix.
    pub routes: Vec<RouteConfig>,
    /// Idle time after which a bucket is evicted, in seconds.
    pub bucket_idle_secs: u64,
    /// Maximum number of tracked buckets.
    pub max_entries: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth: TierLimit::new(5.0, 10),
            standard: TierLimit::new(10.0, 20),
            expensive: TierLimit::new(2.0, 5),
            webhook: TierLimit::new(20.0, 50),
            routes: vec![
                RouteConfig::new("/health", EndpointTier::Health),
                RouteConfig::new("/api/auth/", EndpointTier::Auth),
                RouteConfig::new("/api/reports/", EndpointTier::Expensive),
                RouteConfig::new("/api/webhooks/", EndpointTier::Webhook),
            ],
            bucket_idle_secs: 180,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl RateLimitConfig {
    /// Limits for a tier. `None` means the tier is unlimited.
    #[must_use]
    pub const fn limit_for(&self, tier: EndpointTier) -> Option<TierLimit> {
        match tier {
            EndpointTier::Health => None,
            EndpointTier::Auth => Some(self.auth),
            EndpointTier::Standard => Some(self.standard),
            EndpointTier::Expensive => Some(self.expensive),
            EndpointTier::Webhook => Some(self.webhook),
        }
    }

    /// Mutable limits for a tier.
    pub fn limit_for_mut(&mut self, tier: EndpointTier) -> Option<&mut TierLimit> {
        match tier {
            EndpointTier::Health => None,
            EndpointTier::Auth => Some(&mut self.auth),
            EndpointTier::Standard => Some(&mut self.standard),
            EndpointTier::Expensive => Some(&mut self.expensive),
            EndpointTier::Webhook => Some(&mut self.webhook),
        }
    }

    /// Bucket idle TTL.
    #[must_use]
    pub const fn bucket_idle(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_secs)
    }
}

/// Configuration for request fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Requests per fingerprint within the window before it is suspicious.
    pub max_requests: u64,
    /// Observation window, in minutes.
    pub window_minutes: u64,
    /// Distinct IPs per fingerprint within the window before it is suspicious.
    pub suspicious_threshold: usize,
    /// Cap on distinct IPs remembered per fingerprint.
    pub max_tracked_ips: usize,
    /// Reject requests whose User-Agent matches the deny-list.
    pub block_suspicious_agents: bool,
    /// Escalate suspicious fingerprints to blocked.
    pub block_distributed: bool,
    /// Give each fingerprint seen from too many IPs a shared token bucket,
    /// refilling at `max_requests` per window with a burst of a tenth of that.
    pub throttle_distributed: bool,
    /// Additional User-Agent substrings for the deny-list.
    pub extra_suspicious_agents: Vec<String>,
    /// Maximum number of tracked fingerprints.
    pub max_entries: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_minutes: 5,
            suspicious_threshold: 10,
            max_tracked_ips: 256,
            block_suspicious_agents: false,
            block_distributed: false,
            throttle_distributed: false,
            extra_suspicious_agents: Vec::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl FingerprintConfig {
    /// Observation window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes.saturating_mul(60))
    }

    /// Token bucket shared by all sources of a distributed fingerprint.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn distributed_limit(&self) -> TierLimit {
        let window = self.window().as_secs_f64().max(1.0);
        let burst = u32::try_from(self.max_requests / 10).unwrap_or(u32::MAX).max(1);
        TierLimit::new(self.max_requests as f64 / window, burst)
    }
}

/// Configuration for the background expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl SweepConfig {
    /// Sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Main `DDoS` protection configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosConfig {
    /// IP block store settings.
    pub ip_block: IpBlockConfig,
    /// Circuit breaker settings.
    pub circuit: CircuitConfig,
    /// Connection admission settings.
    pub connection: ConnectionConfig,
    /// Tiered rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Fingerprinting settings.
    pub fingerprint: FingerprintConfig,
    /// Sweep settings.
    pub sweep: SweepConfig,
}

impl DdosConfig {
    /// Create a new builder for `DDoS` configuration.
    #[must_use]
    pub fn builder() -> DdosConfigBuilder {
        DdosConfigBuilder::default()
    }

    /// Validate thresholds. Invalid configuration is fatal at startup.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Config` describing the first invalid value.
    pub fn validate(&self) -> DdosResult<()> {
        fn positive(value: u64, name: &str) -> DdosResult<()> {
            if value == 0 {
                return Err(DdosError::Config(format!("{name} must be greater than zero")));
            }
            Ok(())
        }

        fn bounded(value: Duration, name: &str) -> DdosResult<()> {
            if value > MAX_DURATION {
                return Err(DdosError::Config(format!(
                    "{name} must not exceed {} seconds",
                    MAX_DURATION.as_secs()
                )));
            }
            Ok(())
        }

        bounded(self.ip_block.block_duration(), "ip_block.block_duration_minutes")?;
        bounded(self.ip_block.violation_window(), "ip_block.violation_window_minutes")?;
        bounded(self.circuit.open_timeout(), "circuit.open_timeout_secs")?;
        bounded(self.rate_limit.bucket_idle(), "rate_limit.bucket_idle_secs")?;
        bounded(self.fingerprint.window(), "fingerprint.window_minutes")?;
        bounded(self.sweep.interval(), "sweep.interval_secs")?;

        positive(u64::from(self.ip_block.max_violations), "ip_block.max_violations")?;
        positive(self.ip_block.block_duration_minutes, "ip_block.block_duration_minutes")?;
        positive(self.ip_block.violation_window_minutes, "ip_block.violation_window_minutes")?;
        positive(self.ip_block.max_entries as u64, "ip_block.max_entries")?;

        positive(self.circuit.max_concurrent, "circuit.max_concurrent")?;
        positive(self.circuit.max_rps, "circuit.max_rps")?;
        positive(self.circuit.open_timeout_secs, "circuit.open_timeout_secs")?;
        positive(u64::from(self.circuit.half_open_max_trials), "circuit.half_open_max_trials")?;

        positive(self.connection.max_connections as u64, "connection.max_connections")?;

        for tier in EndpointTier::LIMITED {
            if let Some(limit) = self.rate_limit.limit_for(tier) {
                if !limit.rps.is_finite() || limit.rps <= 0.0 {
                    return Err(DdosError::Config(format!(
                        "rate_limit.{tier}.rps must be a positive number, got {}",
                        limit.rps
                    )));
                }
                positive(u64::from(limit.burst), &format!("rate_limit.{tier}.burst"))?;
            }
        }
        if let Some(route) = self.rate_limit.routes.iter().find(|r| r.prefix.is_empty()) {
            return Err(DdosError::Config(format!(
                "rate_limit.routes: empty prefix for tier {}",
                route.tier
            )));
        }
        positive(self.rate_limit.bucket_idle_secs, "rate_limit.bucket_idle_secs")?;
        positive(self.rate_limit.max_entries as u64, "rate_limit.max_entries")?;

        positive(self.fingerprint.max_requests, "fingerprint.max_requests")?;
        positive(self.fingerprint.window_minutes, "fingerprint.window_minutes")?;
        positive(self.fingerprint.suspicious_threshold as u64, "fingerprint.suspicious_threshold")?;
        if self.fingerprint.max_tracked_ips <= self.fingerprint.suspicious_threshold {
            return Err(DdosError::Config(format!(
                "fingerprint.max_tracked_ips ({}) must exceed fingerprint.suspicious_threshold ({})",
                self.fingerprint.max_tracked_ips, self.fingerprint.suspicious_threshold
            )));
        }
        positive(self.fingerprint.max_entries as u64, "fingerprint.max_entries")?;

        positive(self.sweep.interval_secs, "sweep.interval_secs")?;
        Ok(())
    }
}

/// Builder for `DdosConfig`.
#[derive(Debug, Clone, Default)]
pub struct DdosConfigBuilder {
    config: DdosConfig,
}

impl DdosConfigBuilder {
    /// Set IP block configuration.
    #[must_use]
    pub fn ip_block(mut self, config: IpBlockConfig) -> Self {
        self.config.ip_block = config;
        self
    }

    /// Set circuit breaker configuration.
    #[must_use]
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.config.circuit = config;
        self
    }

    /// Set connection configuration.
    #[must_use]
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set rate limit configuration.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Override a single tier's limits. Ignored for the health tier.
    #[must_use]
    pub fn tier(mut self, tier: EndpointTier, limit: TierLimit) -> Self {
        if let Some(slot) = self.config.rate_limit.limit_for_mut(tier) {
            *slot = limit;
        }
        self
    }

    /// Add a routing entry.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<String>, tier: EndpointTier) -> Self {
        self.config.rate_limit.routes.push(RouteConfig::new(prefix, tier));
        self
    }

    /// Set fingerprint configuration.
    #[must_use]
    pub fn fingerprint(mut self, config: FingerprintConfig) -> Self {
        self.config.fingerprint = config;
        self
    }

    /// Set sweep configuration.
    #[must_use]
    pub fn sweep(mut self, config: SweepConfig) -> Self {
        self.config.sweep = config;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> DdosConfig {
        self.config
    }
}
