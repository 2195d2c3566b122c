//! The request admission pipeline.
//!
//! [`DdosProtection`] chains the per-request layers in a fixed order:
//!
//! 1. IP block store
//! 2. circuit breaker
//! 3. fingerprint tracker
//! 4. tiered rate limiter
//!
//! The first rejection short-circuits the rest. Rejections from layers 2-4
//! are recorded as violations against the caller. Connection admission runs
//! separately, at accept time, through [`DdosProtection::admit_connection`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::blocklist::{IpBlockStore, ViolationOutcome};
use crate::circuit::{CircuitBreaker, CircuitStats, InFlight};
use crate::config::DdosConfig;
use crate::connection::{ConnectionLimiter, ConnectionPermit, ConnectionStats};
use crate::error::{DdosError, DdosResult};
use crate::events::{EventSink, ProtectionEvent, TracingSink};
use crate::fingerprint::{
    Classification, Fingerprint, FingerprintStats, FingerprintTracker, FlagReason,
    RequestSignature,
};
use crate::rate_limit::{EndpointTier, RateLimitStatus, TieredRateLimiter};

/// Retry hint for throttled distributed fingerprints.
const FINGERPRINT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What the pipeline needs to know about a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Resolved caller IP.
    pub ip: IpAddr,
    /// Request path, used for tier classification.
    pub path: String,
    /// Fingerprint inputs.
    pub signature: RequestSignature,
    /// Explicit tier, bypassing path classification.
    pub tier: Option<EndpointTier>,
}

impl RequestContext {
    /// Create a context for a request.
    #[must_use]
    pub fn new(ip: IpAddr, path: impl Into<String>, signature: RequestSignature) -> Self {
        Self {
            ip,
            path: path.into(),
            signature,
            tier: None,
        }
    }

    /// Force a tier instead of classifying the path.
    #[must_use]
    pub const fn with_tier(mut self, tier: EndpointTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// An admitted request.
///
/// Holds the request's circuit breaker slot. Call [`finish`](Self::finish)
/// once the handler has produced a response; dropping it without doing so
/// counts as a cancelled request.
#[derive(Debug)]
#[must_use = "dropping the admission immediately ends the request"]
pub struct Admitted {
    /// The request's fingerprint.
    pub fingerprint: Fingerprint,
    /// Tier the request was rate limited under.
    pub tier: EndpointTier,
    /// Rate-limit state after this request, for limited tiers.
    pub rate: Option<RateLimitStatus>,
    /// Fingerprint classification. Never `Blocked`.
    pub classification: Classification,
    guard: InFlight,
}

impl Admitted {
    /// Whether the fingerprint was flagged but let through.
    #[must_use]
    pub fn is_suspicious(&self) -> bool {
        self.classification == Classification::Suspicious
    }

    /// Whether this request is a half-open circuit trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.guard.is_trial()
    }

    /// Report the handler outcome and release the request's slot.
    pub fn finish(self, success: bool) {
        self.guard.finish(success);
    }
}

/// Counts of entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Violation records removed.
    pub violation_records: usize,
    /// Rate-limit buckets removed.
    pub buckets: usize,
    /// Fingerprint records removed.
    pub fingerprints: usize,
}

impl SweepReport {
    /// Total entries removed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.violation_records + self.buckets + self.fingerprints
    }
}

/// Snapshot of every layer's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdosStats {
    /// Active bans.
    pub banned_ips: usize,
    /// IPs with a violation record.
    pub tracked_violators: usize,
    /// Circuit breaker.
    pub circuit: CircuitStats,
    /// Connection admission.
    pub connections: ConnectionStats,
    /// Live rate-limit buckets.
    pub rate_limit_buckets: usize,
    /// Fingerprint tracker.
    pub fingerprints: FingerprintStats,
}

/// Multi-layer request admission.
#[derive(Debug)]
pub struct DdosProtection {
    config: DdosConfig,
    blocklist: IpBlockStore,
    circuit: Arc<CircuitBreaker>,
    fingerprints: FingerprintTracker,
    rate_limiter: TieredRateLimiter,
    connections: Arc<ConnectionLimiter>,
    events: Arc<dyn EventSink>,
}

impl DdosProtection {
    /// Create a pipeline that logs events through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Config` if the configuration is invalid.
    pub fn new(config: DdosConfig) -> DdosResult<Self> {
        Self::with_events(config, Arc::new(TracingSink))
    }

    /// Create a pipeline that reports events to `events`.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Config` if the configuration is invalid.
    pub fn with_events(config: DdosConfig, events: Arc<dyn EventSink>) -> DdosResult<Self> {
        config.validate()?;
        Ok(Self::build(config, events))
    }

    /// Create a pipeline with default settings.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::build(DdosConfig::default(), Arc::new(TracingSink))
    }

    fn build(config: DdosConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            blocklist: IpBlockStore::from_config(&config.ip_block),
            circuit: Arc::new(CircuitBreaker::with_events(&config.circuit, Arc::clone(&events))),
            fingerprints: FingerprintTracker::new(&config.fingerprint),
            rate_limiter: TieredRateLimiter::new(config.rate_limit.clone()),
            connections: Arc::new(ConnectionLimiter::from_config(&config.connection)),
            events,
            config,
        }
    }

    // ==================== Admission ====================

    /// Run a request through every layer.
    ///
    /// # Errors
    ///
    /// Returns the first layer's rejection.
    pub fn evaluate(&self, ctx: &RequestContext) -> DdosResult<Admitted> {
        self.evaluate_at(ctx, Instant::now())
    }

    /// [`evaluate`](Self::evaluate) at a given instant.
    ///
    /// # Errors
    ///
    /// See [`evaluate`](Self::evaluate).
    pub fn evaluate_at(&self, ctx: &RequestContext, now: Instant) -> DdosResult<Admitted> {
        let ip = ctx.ip;

        if let Err(err) = self.blocklist.check_at(&ip, now) {
            return Err(self.reject(ip, err, None, now));
        }

        let guard = self
            .circuit
            .enter_at(now)
            .map_err(|err| self.reject(ip, err, None, now))?;

        let verdict = self.fingerprints.classify_at(ip, &ctx.signature, now);
        if verdict.newly_flagged {
            self.events.emit(ProtectionEvent::DistributedAttackDetected {
                fingerprint: verdict.fingerprint.short().to_string(),
                distinct_ips: verdict.distinct_ips,
                requests: verdict.requests,
            });
        }

        let tier = ctx
            .tier
            .unwrap_or_else(|| self.rate_limiter.classify(&ctx.path));

        if verdict.classification == Classification::Blocked {
            if verdict.reason == Some(FlagReason::SuspiciousAgent) {
                self.events.emit(ProtectionEvent::SuspiciousAgentBlocked {
                    ip,
                    user_agent: ctx.signature.user_agent().to_string(),
                });
            }
            drop(guard);
            let err = DdosError::FingerprintBlocked {
                ip,
                fingerprint: verdict.fingerprint,
            };
            return Err(self.reject(ip, err, Some(tier), now));
        }
        if verdict.throttled {
            drop(guard);
            let err = DdosError::FingerprintThrottled {
                ip,
                fingerprint: verdict.fingerprint,
                retry_after: FINGERPRINT_RETRY_AFTER,
            };
            return Err(self.reject(ip, err, Some(tier), now));
        }

        let rate = self
            .rate_limiter
            .allow_at(ip, tier, now)
            .map_err(|err| self.reject(ip, err, Some(tier), now))?;

        Ok(Admitted {
            fingerprint: verdict.fingerprint,
            tier,
            rate,
            classification: verdict.classification,
            guard,
        })
    }

    /// Record a rejection and emit its events. Returns the rejection unchanged.
    fn reject(&self, ip: IpAddr, err: DdosError, tier: Option<EndpointTier>, now: Instant) -> DdosError {
        let circuit = match &err {
            DdosError::Overloaded { state } => Some(*state),
            _ => None,
        };
        self.events.emit(ProtectionEvent::RequestRejected {
            ip,
            reason: err.reason(),
            tier,
            circuit,
        });

        if err.is_violation() {
            if let ViolationOutcome::Banned { violations, until } =
                self.blocklist.record_violation_at(&ip, now)
            {
                self.emit_ban(ip, violations, until.saturating_duration_since(now));
            }
        }
        err
    }

    fn emit_ban(&self, ip: IpAddr, violations: u32, remaining: Duration) {
        let now = Utc::now();
        let until = chrono::Duration::from_std(remaining)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.events.emit(ProtectionEvent::BanApplied {
            ip,
            violations,
            until,
        });
    }

    /// Claim a transport connection slot for `peer`.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::ConnectionRefused` when the connection ceiling is reached.
    pub fn admit_connection(&self, peer: SocketAddr) -> DdosResult<ConnectionPermit> {
        self.connections.try_acquire().inspect_err(|err| {
            if let DdosError::ConnectionRefused { active, max } = err {
                self.events.emit(ProtectionEvent::ConnectionRefused {
                    peer,
                    active: *active,
                    max: *max,
                });
            }
        })
    }

    // ==================== Operator Controls ====================

    /// Ban an IP for `duration`, or the configured ban length.
    pub fn ban(&self, ip: IpAddr, duration: Option<Duration>) {
        let now = Instant::now();
        let duration = duration.unwrap_or_else(|| self.blocklist.block_duration());
        let until = self.blocklist.ban_at(&ip, duration, now);
        info!(ip = %ip, duration_secs = duration.as_secs(), "Manual ban");
        self.emit_ban(
            ip,
            self.blocklist.violation_count(&ip),
            until.saturating_duration_since(now),
        );
    }

    /// Lift a ban. Returns whether the IP was banned.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let lifted = self.blocklist.unban(&ip);
        if lifted {
            self.events.emit(ProtectionEvent::BanLifted { ip });
        }
        lifted
    }

    /// Whether an IP is banned right now.
    #[must_use]
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.blocklist.is_banned(&ip)
    }

    /// Active bans with their remaining time.
    #[must_use]
    pub fn banned_ips(&self) -> Vec<(IpAddr, Duration)> {
        self.blocklist.banned_ips()
    }

    /// Force the circuit breaker closed.
    pub fn reset_circuit(&self) {
        self.circuit.reset();
    }

    // ==================== Maintenance ====================

    /// Remove expired entries from every store.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at a given instant.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            violation_records: self.blocklist.sweep_at(now),
            buckets: self.rate_limiter.sweep_at(now),
            fingerprints: self.fingerprints.sweep_at(now),
        };
        if report.total() > 0 {
            info!(
                violation_records = report.violation_records,
                buckets = report.buckets,
                fingerprints = report.fingerprints,
                "Swept expired protection state"
            );
        } else {
            debug!("Sweep found nothing to remove");
        }
        report
    }

    // ==================== Statistics ====================

    /// Counters from every layer.
    #[must_use]
    pub fn stats(&self) -> DdosStats {
        let now = Instant::now();
        DdosStats {
            banned_ips: self.blocklist.banned_count_at(now),
            tracked_violators: self.blocklist.tracked_count(),
            circuit: self.circuit.stats_at(now),
            connections: self.connections.stats(),
            rate_limit_buckets: self.rate_limiter.bucket_count(),
            fingerprints: self.fingerprints.stats(),
        }
    }

    // ==================== Accessors ====================

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DdosConfig {
        &self.config
    }

    /// IP block store.
    #[must_use]
    pub const fn blocklist(&self) -> &IpBlockStore {
        &self.blocklist
    }

    /// Circuit breaker.
    #[must_use]
    pub const fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Fingerprint tracker.
    #[must_use]
    pub const fn fingerprints(&self) -> &FingerprintTracker {
        &self.fingerprints
    }

    /// Tiered rate limiter.
    #[must_use]
    pub const fn rate_limiter(&self) -> &TieredRateLimiter {
        &self.rate_limiter
    }

    /// Connection limiter.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionLimiter> {
        &self.connections
    }
}

impl Default for DdosProtection {
    fn default() -> Self {
        Self::with_defaults()
    }
}
