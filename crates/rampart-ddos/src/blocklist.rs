//! IP block store: violation accounting and time-limited bans.
//!
//! Every rejection anywhere in the pipeline is recorded here as a violation.
//! Once an IP collects `max_violations` within the violation window it is
//! banned for `block_duration`. Bans are never shortened by traffic; they
//! only expire with time or by an explicit [`IpBlockStore::unban`].

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::config::IpBlockConfig;
use crate::error::{DdosError, DdosResult};

/// Violation history for one IP.
#[derive(Debug, Clone)]
struct ViolationRecord {
    /// Violations counted in the current window.
    violations: u32,
    /// Start of the current counting window.
    window_start: Instant,
    /// Present iff a ban was applied; active while in the future.
    blocked_until: Option<Instant>,
}

impl ViolationRecord {
    fn new(now: Instant) -> Self {
        Self {
            violations: 1,
            window_start: now,
            blocked_until: None,
        }
    }

    /// A record for a manual ban, which counts no violations.
    fn banned(now: Instant, until: Instant) -> Self {
        Self {
            violations: 0,
            window_start: now,
            blocked_until: Some(until),
        }
    }

    fn is_banned_at(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    fn restart(&mut self, now: Instant) {
        self.violations = 1;
        self.window_start = now;
        self.blocked_until = None;
    }
}

/// `now + duration`, clamped to the latest instant the platform can represent.
fn deadline(now: Instant, duration: Duration) -> Instant {
    let mut duration = duration;
    loop {
        if let Some(until) = now.checked_add(duration) {
            return until;
        }
        duration /= 2;
    }
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// Violation counted, no ban yet.
    Counted {
        /// Violations in the current window, including this one.
        violations: u32,
    },
    /// This violation crossed the threshold and a ban was applied.
    Banned {
        /// Violations in the window that triggered the ban.
        violations: u32,
        /// When the ban expires.
        until: Instant,
    },
    /// The IP is already banned; the ban is left untouched.
    AlreadyBanned,
    /// The store is full and the IP is not tracked.
    Untracked,
}

/// Shared memory of which callers have misbehaved.
#[derive(Debug)]
pub struct IpBlockStore {
    /// Violations that trigger a ban.
    max_violations: u32,
    /// Ban length.
    block_duration: Duration,
    /// Violation counting window.
    violation_window: Duration,
    /// Maximum tracked IPs.
    max_entries: usize,
    /// Records by IP.
    records: DashMap<IpAddr, ViolationRecord>,
}

impl IpBlockStore {
    /// Create a store with explicit thresholds.
    #[must_use]
    pub fn new(max_violations: u32, block_duration: Duration, violation_window: Duration) -> Self {
        Self {
            max_violations: max_violations.max(1),
            block_duration,
            violation_window,
            max_entries: crate::config::DEFAULT_MAX_ENTRIES,
            records: DashMap::new(),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &IpBlockConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            ..Self::new(
                config.max_violations,
                config.block_duration(),
                config.violation_window(),
            )
        }
    }

    /// Check whether an IP may proceed.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Banned` while the IP's ban is active.
    pub fn check(&self, ip: &IpAddr) -> DdosResult<()> {
        self.check_at(ip, Instant::now())
    }

    /// [`check`](Self::check) at a given instant.
    ///
    /// A rejection here is not itself a violation.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::Banned` while the IP's ban is active.
    pub fn check_at(&self, ip: &IpAddr, now: Instant) -> DdosResult<()> {
        let Some(record) = self.records.get(ip) else {
            return Ok(());
        };
        match record.blocked_until {
            Some(until) if until > now => Err(DdosError::Banned {
                ip: *ip,
                retry_after: until.saturating_duration_since(now),
            }),
            _ => Ok(()),
        }
    }

    /// Record a violation for an IP.
    pub fn record_violation(&self, ip: &IpAddr) -> ViolationOutcome {
        self.record_violation_at(ip, Instant::now())
    }

    /// [`record_violation`](Self::record_violation) at a given instant.
    pub fn record_violation_at(&self, ip: &IpAddr, now: Instant) -> ViolationOutcome {
        if !self.records.contains_key(ip) && self.records.len() >= self.max_entries {
            warn!(ip = %ip, max_entries = self.max_entries, "IP block store full, violation not tracked");
            return ViolationOutcome::Untracked;
        }

        match self.records.entry(*ip) {
            Entry::Vacant(vacant) => {
                let mut record = ViolationRecord::new(now);
                let outcome = self.apply_threshold(&mut record, now);
                vacant.insert(record);
                outcome
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_banned_at(now) {
                    return ViolationOutcome::AlreadyBanned;
                }
                if record.blocked_until.is_some()
                    || now.saturating_duration_since(record.window_start) >= self.violation_window
                {
                    record.restart(now);
                } else {
                    record.violations = record.violations.saturating_add(1);
                }
                self.apply_threshold(record, now)
            }
        }
    }

    fn apply_threshold(&self, record: &mut ViolationRecord, now: Instant) -> ViolationOutcome {
        if record.violations >= self.max_violations {
            let until = deadline(now, self.block_duration);
            record.blocked_until = Some(until);
            ViolationOutcome::Banned {
                violations: record.violations,
                until,
            }
        } else {
            ViolationOutcome::Counted {
                violations: record.violations,
            }
        }
    }

    /// Ban an IP immediately for the given duration.
    ///
    /// An existing longer ban is kept.
    pub fn ban_at(&self, ip: &IpAddr, duration: Duration, now: Instant) -> Instant {
        let until = deadline(now, duration);
        let mut record = self
            .records
            .entry(*ip)
            .or_insert_with(|| ViolationRecord::banned(now, until));
        let until = record.blocked_until.filter(|u| *u > until).unwrap_or(until);
        record.blocked_until = Some(until);
        until
    }

    /// Ban an IP immediately for the configured duration.
    pub fn ban(&self, ip: &IpAddr) -> Instant {
        self.ban_at(ip, self.block_duration, Instant::now())
    }

    /// Lift a ban and forget the IP's violations.
    pub fn unban(&self, ip: &IpAddr) -> bool {
        self.records.remove(ip).is_some_and(|(_, r)| r.blocked_until.is_some())
    }

    /// Whether an IP is banned right now.
    #[must_use]
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.check(ip).is_err()
    }

    /// Violations counted in the IP's current window.
    #[must_use]
    pub fn violation_count(&self, ip: &IpAddr) -> u32 {
        self.records.get(ip).map_or(0, |r| r.violations)
    }

    /// Active bans with their remaining time.
    #[must_use]
    pub fn banned_ips_at(&self, now: Instant) -> Vec<(IpAddr, Duration)> {
        self.records
            .iter()
            .filter_map(|entry| {
                entry
                    .blocked_until
                    .filter(|until| *until > now)
                    .map(|until| (*entry.key(), until.saturating_duration_since(now)))
            })
            .collect()
    }

    /// Active bans with their remaining time.
    #[must_use]
    pub fn banned_ips(&self) -> Vec<(IpAddr, Duration)> {
        self.banned_ips_at(Instant::now())
    }

    /// Number of active bans.
    #[must_use]
    pub fn banned_count_at(&self, now: Instant) -> usize {
        self.records.iter().filter(|r| r.is_banned_at(now)).count()
    }

    /// Number of tracked IPs.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Remove records whose window has elapsed and which hold no active ban.
    ///
    /// Shards are locked one at a time, so admission checks keep running.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|ip, record| {
            let keep = record.is_banned_at(now)
                || now.saturating_duration_since(record.window_start) < self.violation_window;
            if !keep {
                debug!(ip = %ip, "Evicting expired violation record");
            }
            keep
        });
        before.saturating_sub(self.records.len())
    }

    /// Ban length.
    #[must_use]
    pub const fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Violation counting window.
    #[must_use]
    pub const fn violation_window(&self) -> Duration {
        self.violation_window
    }
}

impl Default for IpBlockStore {
    fn default() -> Self {
        Self::from_config(&IpBlockConfig::default())
    }
}
