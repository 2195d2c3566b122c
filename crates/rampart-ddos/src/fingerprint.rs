//! Request fingerprinting and distributed-attack detection.
//!
//! A fingerprint is a hash of request attributes that do not identify the
//! caller: the User-Agent, the `Accept*` headers and the set of header names.
//! Botnets replaying one client template from many source IPs collapse onto
//! one fingerprint, which is what the tracker watches for.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{FingerprintConfig, TierLimit};
use crate::rate_limit::TokenBucket;

/// Headers that vary per request and are left out of the header-name set.
const VOLATILE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-request-id",
    "x-forwarded-for",
    "x-real-ip",
    "content-length",
];

/// User-Agent substrings that mark scripted or scanning clients.
const DEFAULT_SUSPICIOUS_AGENTS: &[&str] = &[
    "python-requests",
    "python-urllib",
    "curl",
    "wget",
    "httpie",
    "postman",
    "bot",
    "crawler",
    "spider",
    "scraper",
    "scanner",
    "nikto",
    "sqlmap",
    "nmap",
    "masscan",
    "zap",
    "burp",
    "acunetix",
    "nessus",
];

/// Hex-encoded request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of [`short`](Self::short).
    pub const SHORT_LEN: usize = 8;

    /// Full hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, as sent in response headers.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..Self::SHORT_LEN).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request attributes a fingerprint is computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSignature {
    user_agent: String,
    accept: String,
    accept_language: String,
    accept_encoding: String,
    header_names: Vec<String>,
}

impl RequestSignature {
    /// Start a signature from a User-Agent.
    #[must_use]
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..Self::default()
        }
    }

    /// Build a signature from raw header pairs.
    ///
    /// Names are compared case-insensitively. For repeated headers the first
    /// value is used.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut signature = Self::default();
        let mut seen = HashSet::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if !seen.insert(name.clone()) {
                continue;
            }
            match name.as_str() {
                "user-agent" => signature.user_agent = value.to_string(),
                "accept" => signature.accept = value.to_string(),
                "accept-language" => signature.accept_language = value.to_string(),
                "accept-encoding" => signature.accept_encoding = value.to_string(),
                _ => {}
            }
            signature.header_names.push(name);
        }
        signature
    }

    /// Set the `Accept` value.
    #[must_use]
    pub fn accept(mut self, value: impl Into<String>) -> Self {
        self.accept = value.into();
        self
    }

    /// Set the `Accept-Language` value.
    #[must_use]
    pub fn accept_language(mut self, value: impl Into<String>) -> Self {
        self.accept_language = value.into();
        self
    }

    /// Set the `Accept-Encoding` value.
    #[must_use]
    pub fn accept_encoding(mut self, value: impl Into<String>) -> Self {
        self.accept_encoding = value.into();
        self
    }

    /// Record a header name as present.
    #[must_use]
    pub fn header(mut self, name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if !self.header_names.contains(&name) {
            self.header_names.push(name);
        }
        self
    }

    /// The User-Agent.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Hash the signature.
    ///
    /// SHA-256 over `ua|accept|accept-language|accept-encoding|` followed by
    /// the sorted, comma-joined non-volatile header names, truncated to 16
    /// bytes.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut names: Vec<&str> = self
            .header_names
            .iter()
            .map(String::as_str)
            .filter(|name| !VOLATILE_HEADERS.contains(name))
            .collect();
        names.sort_unstable();

        let mut hasher = Sha256::new();
        for part in [
            &self.user_agent,
            &self.accept,
            &self.accept_language,
            &self.accept_encoding,
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(names.join(",").as_bytes());
        let digest = hasher.finalize();
        Fingerprint(hex::encode(&digest[..16]))
    }
}

/// Fingerprint classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Nothing unusual.
    Normal,
    /// Flagged for operators; admitted unless escalation is enabled.
    Suspicious,
    /// Rejected.
    Blocked,
}

/// Why a fingerprint was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// User-Agent matched the deny-list.
    SuspiciousAgent,
    /// Too many distinct IPs share the fingerprint.
    DistributedSources,
    /// Too many requests carry the fingerprint.
    ExcessiveRequests,
}

/// Result of classifying one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintVerdict {
    /// The request's fingerprint.
    pub fingerprint: Fingerprint,
    /// Classification.
    pub classification: Classification,
    /// Why it was flagged, if it was.
    pub reason: Option<FlagReason>,
    /// Distinct IPs seen for the fingerprint in the current window.
    pub distinct_ips: usize,
    /// Requests seen for the fingerprint in the current window.
    pub requests: u64,
    /// True only on the request that first crossed the distinct-IP or
    /// request-count threshold this window.
    pub newly_flagged: bool,
    /// The fingerprint's shared bucket was empty. Only set for distributed
    /// fingerprints when throttling is enabled.
    pub throttled: bool,
}

#[derive(Debug)]
struct FingerprintRecord {
    seen_ips: HashSet<IpAddr>,
    request_count: u64,
    window_start: Instant,
    flagged: bool,
    /// Shared budget for distributed sources, kept across window restarts.
    bucket: Option<TokenBucket>,
}

impl FingerprintRecord {
    fn new(now: Instant) -> Self {
        Self {
            seen_ips: HashSet::new(),
            request_count: 0,
            window_start: now,
            flagged: false,
            bucket: None,
        }
    }

    fn restart(&mut self, now: Instant) {
        self.seen_ips.clear();
        self.request_count = 0;
        self.window_start = now;
        self.flagged = false;
    }
}

/// Fingerprint tracker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FingerprintStats {
    /// Fingerprints tracked.
    pub unique_fingerprints: usize,
    /// Fingerprints flagged in their current window.
    pub flagged_fingerprints: usize,
    /// Deny-list size.
    pub suspicious_agents: usize,
}

/// Tracks fingerprints across source IPs.
#[derive(Debug)]
pub struct FingerprintTracker {
    max_requests: u64,
    window: Duration,
    suspicious_threshold: usize,
    max_tracked_ips: usize,
    block_suspicious_agents: bool,
    block_distributed: bool,
    distributed_limit: Option<TierLimit>,
    max_entries: usize,
    agents: RwLock<Vec<String>>,
    records: DashMap<Fingerprint, FingerprintRecord>,
}

impl FingerprintTracker {
    /// Create a tracker from configuration.
    #[must_use]
    pub fn new(config: &FingerprintConfig) -> Self {
        let mut agents: Vec<String> = DEFAULT_SUSPICIOUS_AGENTS
            .iter()
            .map(|a| (*a).to_string())
            .collect();
        for extra in &config.extra_suspicious_agents {
            let extra = extra.to_lowercase();
            if !extra.is_empty() && !agents.contains(&extra) {
                agents.push(extra);
            }
        }
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            suspicious_threshold: config.suspicious_threshold,
            max_tracked_ips: config.max_tracked_ips,
            block_suspicious_agents: config.block_suspicious_agents,
            block_distributed: config.block_distributed,
            distributed_limit: config
                .throttle_distributed
                .then(|| config.distributed_limit()),
            max_entries: config.max_entries,
            agents: RwLock::new(agents),
            records: DashMap::new(),
        }
    }

    /// Whether a User-Agent is on the deny-list.
    ///
    /// A missing or `-` agent always matches; everything else is a
    /// case-insensitive substring match.
    #[must_use]
    pub fn is_suspicious_agent(&self, user_agent: &str) -> bool {
        let ua = user_agent.trim();
        if ua.is_empty() || ua == "-" {
            return true;
        }
        let ua = ua.to_lowercase();
        self.agents.read().iter().any(|pattern| ua.contains(pattern.as_str()))
    }

    /// Add a User-Agent substring to the deny-list.
    pub fn add_suspicious_agent(&self, pattern: &str) {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return;
        }
        let mut agents = self.agents.write();
        if !agents.contains(&pattern) {
            agents.push(pattern);
        }
    }

    /// Record a request and classify it.
    pub fn classify(&self, ip: IpAddr, signature: &RequestSignature) -> FingerprintVerdict {
        self.classify_at(ip, signature, Instant::now())
    }

    /// [`classify`](Self::classify) at a given instant.
    pub fn classify_at(
        &self,
        ip: IpAddr,
        signature: &RequestSignature,
        now: Instant,
    ) -> FingerprintVerdict {
        let fingerprint = signature.fingerprint();
        let bad_agent =
            self.block_suspicious_agents && self.is_suspicious_agent(signature.user_agent());

        let (distinct_ips, requests, suspicious, newly_flagged, throttled) =
            self.record(&fingerprint, ip, now);

        let (classification, reason) = if bad_agent {
            (Classification::Blocked, Some(FlagReason::SuspiciousAgent))
        } else if let Some(reason) = suspicious {
            let classification = if self.block_distributed {
                Classification::Blocked
            } else {
                Classification::Suspicious
            };
            (classification, Some(reason))
        } else {
            (Classification::Normal, None)
        };

        if newly_flagged {
            debug!(
                fingerprint = %fingerprint.short(),
                distinct_ips,
                requests,
                "Fingerprint flagged"
            );
        }

        FingerprintVerdict {
            fingerprint,
            classification,
            reason,
            distinct_ips,
            requests,
            newly_flagged,
            throttled: throttled && classification == Classification::Suspicious,
        }
    }

    /// Update the record for `fingerprint` and return
    /// `(distinct_ips, requests, flag, newly_flagged, throttled)`.
    fn record(
        &self,
        fingerprint: &Fingerprint,
        ip: IpAddr,
        now: Instant,
    ) -> (usize, u64, Option<FlagReason>, bool, bool) {
        if !self.records.contains_key(fingerprint) && self.records.len() >= self.max_entries {
            warn!(fingerprint = %fingerprint.short(), "Fingerprint store full, not tracking");
            return (0, 0, None, false, false);
        }

        let mut record = self
            .records
            .entry(fingerprint.clone())
            .or_insert_with(|| FingerprintRecord::new(now));

        if now.saturating_duration_since(record.window_start) >= self.window {
            record.restart(now);
        }
        if record.seen_ips.len() < self.max_tracked_ips {
            record.seen_ips.insert(ip);
        }
        record.request_count = record.request_count.saturating_add(1);

        let distinct_ips = record.seen_ips.len();
        let requests = record.request_count;
        let flag = if distinct_ips > self.suspicious_threshold {
            Some(FlagReason::DistributedSources)
        } else if requests > self.max_requests {
            Some(FlagReason::ExcessiveRequests)
        } else {
            None
        };
        let newly_flagged = flag.is_some() && !record.flagged;
        if flag.is_some() {
            record.flagged = true;
        }

        let throttled = match (flag, self.distributed_limit) {
            (Some(FlagReason::DistributedSources), Some(limit)) => !record
                .bucket
                .get_or_insert_with(|| TokenBucket::new(limit, now))
                .try_take(now),
            _ => false,
        };
        (distinct_ips, requests, flag, newly_flagged, throttled)
    }

    /// Drop records whose window has fully elapsed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at a given instant.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.window_start) < self.window);
        before.saturating_sub(self.records.len())
    }

    /// Number of tracked fingerprints.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> FingerprintStats {
        FingerprintStats {
            unique_fingerprints: self.records.len(),
            flagged_fingerprints: self.records.iter().filter(|r| r.flagged).count(),
            suspicious_agents: self.agents.read().len(),
        }
    }
}

impl Default for FingerprintTracker {
    fn default() -> Self {
        Self::new(&FingerprintConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/128.0";

    fn browser() -> RequestSignature {
        RequestSignature::new(BROWSER)
            .accept("text/html")
            .accept_language("en")
            .accept_encoding("gzip")
            .header("user-agent")
            .header("accept")
            .header("host")
    }

    fn ip(n: u32) -> IpAddr {
        IpAddr::from(std::net::Ipv4Addr::from(0x0a00_0000 + n))
    }

    fn tracker(config: FingerprintConfig) -> FingerprintTracker {
        FingerprintTracker::new(&config)
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = browser().fingerprint();
        assert_eq!(fp.as_str().len(), 32);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 8);
        assert!(fp.as_str().starts_with(fp.short()));
    }

    #[test]
    fn test_fingerprint_ignores_volatile_headers_and_order() {
        let a = browser().header("cookie").header("x-forwarded-for");
        let b = RequestSignature::new(BROWSER)
            .header("HOST")
            .header("Accept")
            .header("User-Agent")
            .header("Authorization")
            .accept("text/html")
            .accept_language("en")
            .accept_encoding("gzip");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_on_agent_and_header_set() {
        let base = browser().fingerprint();
        let other_agent = RequestSignature::new("curl/8.0")
            .accept("text/html")
            .accept_language("en")
            .accept_encoding("gzip")
            .header("user-agent")
            .header("accept")
            .header("host")
            .fingerprint();
        let extra_header = browser().header("x-custom").fingerprint();
        assert_ne!(base, other_agent);
        assert_ne!(base, extra_header);
    }

    #[test]
    fn test_from_headers_matches_builder() {
        let parsed = RequestSignature::from_headers([
            ("User-Agent", BROWSER),
            ("Accept", "text/html"),
            ("Accept-Language", "en"),
            ("Accept-Encoding", "gzip"),
            ("Host", "example.com"),
            ("Cookie", "session=abc"),
        ]);
        let built = browser()
            .header("accept-language")
            .header("accept-encoding");
        assert_eq!(parsed.user_agent(), BROWSER);
        assert_eq!(parsed.fingerprint(), built.fingerprint());
    }

    #[test]
    fn test_suspicious_agents() {
        let tracker = FingerprintTracker::default();
        assert!(tracker.is_suspicious_agent(""));
        assert!(tracker.is_suspicious_agent("-"));
        assert!(tracker.is_suspicious_agent("python-requests/2.31"));
        assert!(tracker.is_suspicious_agent("sqlmap/1.7#stable"));
        assert!(tracker.is_suspicious_agent("Googlebot/2.1"));
        assert!(!tracker.is_suspicious_agent(BROWSER));

        tracker.add_suspicious_agent("Firefox");
        assert!(tracker.is_suspicious_agent(BROWSER));
    }

    #[test]
    fn test_extra_agents_from_config() {
        let t = tracker(FingerprintConfig {
            extra_suspicious_agents: vec!["Go-http-client".into()],
            ..FingerprintConfig::default()
        });
        assert!(t.is_suspicious_agent("Go-http-client/1.1"));
        assert_eq!(t.stats().suspicious_agents, DEFAULT_SUSPICIOUS_AGENTS.len() + 1);
    }

    #[test]
    fn test_agent_blocking_requires_flag() {
        let now = Instant::now();
        let curl = RequestSignature::new("curl/8.4.0");

        let permissive = FingerprintTracker::default();
        let verdict = permissive.classify_at(ip(1), &curl, now);
        assert_eq!(verdict.classification, Classification::Normal);

        let strict = tracker(FingerprintConfig {
            block_suspicious_agents: true,
            ..FingerprintConfig::default()
        });
        let verdict = strict.classify_at(ip(1), &curl, now);
        assert_eq!(verdict.classification, Classification::Blocked);
        assert_eq!(verdict.reason, Some(FlagReason::SuspiciousAgent));
    }

    #[test]
    fn test_distributed_detection_on_threshold_plus_one() {
        let t = tracker(FingerprintConfig {
            suspicious_threshold: 10,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();

        for n in 1..=10 {
            let verdict = t.classify_at(ip(n), &sig, now);
            assert_eq!(verdict.classification, Classification::Normal, "ip #{n}");
        }
        let verdict = t.classify_at(ip(11), &sig, now);
        assert_eq!(verdict.classification, Classification::Suspicious);
        assert_eq!(verdict.reason, Some(FlagReason::DistributedSources));
        assert_eq!(verdict.distinct_ips, 11);
        assert!(verdict.newly_flagged);

        // Stays flagged for the rest of the window, but only reports once.
        let verdict = t.classify_at(ip(1), &sig, now + Duration::from_secs(60));
        assert_eq!(verdict.classification, Classification::Suspicious);
        assert!(!verdict.newly_flagged);
        assert_eq!(t.stats().flagged_fingerprints, 1);
    }

    #[test]
    fn test_block_distributed_escalates() {
        let t = tracker(FingerprintConfig {
            suspicious_threshold: 2,
            block_distributed: true,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();
        t.classify_at(ip(1), &sig, now);
        t.classify_at(ip(2), &sig, now);
        let verdict = t.classify_at(ip(3), &sig, now);
        assert_eq!(verdict.classification, Classification::Blocked);
    }

    #[test]
    fn test_throttle_distributed_spends_shared_bucket() {
        let t = tracker(FingerprintConfig {
            max_requests: 20,
            suspicious_threshold: 2,
            throttle_distributed: true,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();
        t.classify_at(ip(1), &sig, now);
        t.classify_at(ip(2), &sig, now);

        // Burst of two once the fingerprint is distributed.
        for n in 3..=4 {
            let verdict = t.classify_at(ip(n), &sig, now);
            assert_eq!(verdict.classification, Classification::Suspicious);
            assert!(!verdict.throttled, "ip #{n}");
        }
        let verdict = t.classify_at(ip(5), &sig, now);
        assert_eq!(verdict.classification, Classification::Suspicious);
        assert!(verdict.throttled);

        // 20 requests per 300s refills a token every 15s.
        let later = now + Duration::from_secs(20);
        assert!(!t.classify_at(ip(6), &sig, later).throttled);
        assert!(t.classify_at(ip(7), &sig, later).throttled);
    }

    #[test]
    fn test_distributed_is_not_throttled_by_default() {
        let t = tracker(FingerprintConfig {
            max_requests: 20,
            suspicious_threshold: 2,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();
        for n in 1..=15 {
            assert!(!t.classify_at(ip(n), &sig, now).throttled);
        }
    }

    #[test]
    fn test_excessive_requests_from_one_ip() {
        let t = tracker(FingerprintConfig {
            max_requests: 5,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();
        for _ in 0..5 {
            assert_eq!(t.classify_at(ip(1), &sig, now).classification, Classification::Normal);
        }
        let verdict = t.classify_at(ip(1), &sig, now);
        assert_eq!(verdict.classification, Classification::Suspicious);
        assert_eq!(verdict.reason, Some(FlagReason::ExcessiveRequests));
    }

    #[test]
    fn test_window_expiry_resets_record() {
        let t = tracker(FingerprintConfig {
            suspicious_threshold: 2,
            ..FingerprintConfig::default()
        });
        let t0 = Instant::now();
        let sig = browser();
        for n in 1..=3 {
            t.classify_at(ip(n), &sig, t0);
        }
        let verdict = t.classify_at(ip(4), &sig, t0 + Duration::from_secs(300));
        assert_eq!(verdict.classification, Classification::Normal);
        assert_eq!(verdict.distinct_ips, 1);
        assert_eq!(verdict.requests, 1);
    }

    #[test]
    fn test_seen_ips_are_capped() {
        let t = tracker(FingerprintConfig {
            suspicious_threshold: 3,
            max_tracked_ips: 5,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        let sig = browser();
        let mut last = None;
        for n in 1..=50 {
            last = Some(t.classify_at(ip(n), &sig, now));
        }
        let last = last.unwrap();
        assert_eq!(last.distinct_ips, 5);
        assert_eq!(last.classification, Classification::Suspicious);
    }

    #[test]
    fn test_full_store_is_not_tracked() {
        let t = tracker(FingerprintConfig {
            max_entries: 1,
            suspicious_threshold: 1,
            max_tracked_ips: 4,
            ..FingerprintConfig::default()
        });
        let now = Instant::now();
        t.classify_at(ip(1), &browser(), now);
        let other = RequestSignature::new("other");
        for n in 1..=5 {
            let verdict = t.classify_at(ip(n), &other, now);
            assert_eq!(verdict.classification, Classification::Normal);
        }
        assert_eq!(t.tracked_count(), 1);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let t = FingerprintTracker::default();
        let t0 = Instant::now();
        t.classify_at(ip(1), &browser(), t0);
        t.classify_at(ip(1), &RequestSignature::new("other"), t0 + Duration::from_secs(200));

        let at = t0 + Duration::from_secs(301);
        assert_eq!(t.sweep_at(at), 1);
        assert_eq!(t.sweep_at(at), 0);
        assert_eq!(t.tracked_count(), 1);
    }
}
