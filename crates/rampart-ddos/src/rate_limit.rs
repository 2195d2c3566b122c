//! Tiered per-caller rate limiting.
//!
//! Every request path maps to one [`EndpointTier`]. Each `(ip, tier)` pair
//! owns a token bucket that refills lazily from elapsed time, so idle
//! buckets cost nothing until they are touched again or swept.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{RateLimitConfig, RouteConfig, TierLimit};
use crate::error::{DdosError, DdosResult};

/// Suggested wait returned with every rate-limit rejection.
pub const RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Endpoint class used to pick rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointTier {
    /// Health checks. Never rate limited.
    Health,
    /// Authentication endpoints.
    Auth,
    /// Everything not otherwise classified.
    Standard,
    /// Computationally costly operations.
    Expensive,
    /// Trusted third-party callbacks.
    Webhook,
}

impl EndpointTier {
    /// Tiers that carry a token bucket.
    pub const LIMITED: [Self; 4] = [Self::Auth, Self::Standard, Self::Expensive, Self::Webhook];

    /// Lowercase tier name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Auth => "auth",
            Self::Standard => "standard",
            Self::Expensive => "expensive",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for EndpointTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps request paths to tiers.
///
/// An exact path match wins; otherwise the longest matching prefix; otherwise
/// [`EndpointTier::Standard`].
#[derive(Debug, Clone, Default)]
pub struct TierClassifier {
    exact: HashMap<String, EndpointTier>,
    /// Sorted longest first.
    prefixes: Vec<(String, EndpointTier)>,
}

impl TierClassifier {
    /// Build a classifier from routing entries. Later entries override earlier ones.
    #[must_use]
    pub fn new(routes: &[RouteConfig]) -> Self {
        let mut classifier = Self::default();
        for route in routes {
            classifier.insert(&route.prefix, route.tier);
        }
        classifier
    }

    /// Add or replace a routing entry.
    pub fn insert(&mut self, prefix: &str, tier: EndpointTier) {
        self.exact.insert(prefix.to_string(), tier);
        match self.prefixes.iter_mut().find(|(p, _)| p == prefix) {
            Some(entry) => entry.1 = tier,
            None => {
                self.prefixes.push((prefix.to_string(), tier));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
        }
    }

    /// Classify a request path.
    #[must_use]
    pub fn classify(&self, path: &str) -> EndpointTier {
        if let Some(tier) = self.exact.get(path) {
            return *tier;
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map_or(EndpointTier::Standard, |(_, tier)| *tier)
    }

    /// Number of routing entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Whether there are no routing entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// Continuously refilling token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(limit: TierLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.burst);
        Self {
            tokens: capacity,
            capacity,
            rate: limit.rps,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling to `now`.
    #[must_use]
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate).min(self.capacity)
    }

    /// Time since the bucket was last touched.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }
}

/// Rate-limit state reported for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Tier the request was classified into.
    pub tier: EndpointTier,
    /// Sustained requests per second for the tier.
    pub limit: f64,
    /// Whole tokens left after this request.
    pub remaining: u32,
}

/// Per-IP, per-tier token bucket limiter.
#[derive(Debug)]
pub struct TieredRateLimiter {
    config: RateLimitConfig,
    classifier: RwLock<TierClassifier>,
    buckets: DashMap<(IpAddr, EndpointTier), TokenBucket>,
}

impl TieredRateLimiter {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let classifier = TierClassifier::new(&config.routes);
        Self {
            config,
            classifier: RwLock::new(classifier),
            buckets: DashMap::new(),
        }
    }

    /// Classify a request path into a tier.
    #[must_use]
    pub fn classify(&self, path: &str) -> EndpointTier {
        self.classifier.read().classify(path)
    }

    /// Route a path or path prefix to a tier.
    pub fn set_route(&self, prefix: &str, tier: EndpointTier) {
        self.classifier.write().insert(prefix, tier);
    }

    /// Limits for a tier. `None` for unlimited tiers.
    #[must_use]
    pub const fn limit_for(&self, tier: EndpointTier) -> Option<TierLimit> {
        self.config.limit_for(tier)
    }

    /// Consume a token for `ip` in `tier`.
    ///
    /// Returns `Ok(None)` for unlimited tiers.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::RateLimited` when the bucket is empty.
    pub fn allow(&self, ip: IpAddr, tier: EndpointTier) -> DdosResult<Option<RateLimitStatus>> {
        self.allow_at(ip, tier, Instant::now())
    }

    /// [`allow`](Self::allow) at a given instant.
    ///
    /// # Errors
    ///
    /// See [`allow`](Self::allow).
    pub fn allow_at(
        &self,
        ip: IpAddr,
        tier: EndpointTier,
        now: Instant,
    ) -> DdosResult<Option<RateLimitStatus>> {
        let Some(limit) = self.config.limit_for(tier) else {
            return Ok(None);
        };

        let key = (ip, tier);
        if !self.buckets.contains_key(&key) && self.buckets.len() >= self.config.max_entries {
            warn!(ip = %ip, tier = %tier, "Rate limit store full, admitting untracked caller");
            return Ok(Some(RateLimitStatus {
                tier,
                limit: limit.rps,
                remaining: limit.burst.saturating_sub(1),
            }));
        }

        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(limit, now));

        if bucket.try_take(now) {
            Ok(Some(RateLimitStatus {
                tier,
                limit: limit.rps,
                remaining: whole_tokens(bucket.tokens),
            }))
        } else {
            drop(bucket);
            debug!(ip = %ip, tier = %tier, "Rate limit exceeded");
            Err(DdosError::RateLimited {
                ip,
                tier,
                limit: limit.rps,
                retry_after: RATE_LIMIT_RETRY_AFTER,
            })
        }
    }

    /// Whole tokens currently available to `ip` in `tier`, without consuming.
    #[must_use]
    pub fn remaining_at(&self, ip: IpAddr, tier: EndpointTier, now: Instant) -> Option<u32> {
        let limit = self.config.limit_for(tier)?;
        Some(
            self.buckets
                .get(&(ip, tier))
                .map_or(limit.burst, |b| whole_tokens(b.available(now))),
        )
    }

    /// Evict buckets idle for longer than the configured TTL.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at a given instant.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let ttl = self.config.bucket_idle();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for(now) <= ttl);
        before.saturating_sub(self.buckets.len())
    }

    /// Forget all buckets for an IP.
    pub fn remove(&self, ip: IpAddr) {
        self.buckets.retain(|(bucket_ip, _), _| *bucket_ip != ip);
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for TieredRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_tokens(tokens: f64) -> u32 {
    tokens.max(0.0).floor() as u32
}
