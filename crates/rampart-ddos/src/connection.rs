//! Transport-level connection admission.
//!
//! A saturating counter of open connections, checked at accept time. There
//! is no time-based decay: a slot is held for exactly as long as its
//! [`ConnectionPermit`] lives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{DdosError, DdosResult};

/// Connection limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Open connections.
    pub active: usize,
    /// Ceiling.
    pub max: usize,
    /// Connections accepted since start.
    pub accepted: u64,
    /// Connections refused since start.
    pub refused: u64,
}

/// Caps simultaneously open connections.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_connections: usize,
    active: AtomicUsize,
    accepted: AtomicU64,
    refused: AtomicU64,
}

impl ConnectionLimiter {
    /// Create a limiter.
    #[must_use]
    pub const fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub const fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.max_connections)
    }

    /// Claim a connection slot.
    ///
    /// # Errors
    ///
    /// Returns `DdosError::ConnectionRefused` when every slot is taken.
    pub fn try_acquire(self: &Arc<Self>) -> DdosResult<ConnectionPermit> {
        let max = self.max_connections;
        match self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        {
            Ok(previous) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(active = previous + 1, max, "Connection admitted");
                Ok(ConnectionPermit {
                    limiter: Arc::clone(self),
                })
            }
            Err(active) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                Err(DdosError::ConnectionRefused { active, max })
            }
        }
    }

    /// Open connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.active(),
            max: self.max_connections,
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A held connection slot, released on drop.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_max() {
        let limiter = Arc::new(ConnectionLimiter::new(3));
        let permits: Vec<_> = (0..3).map(|_| limiter.try_acquire().unwrap()).collect();
        assert_eq!(limiter.active(), 3);

        let err = limiter.try_acquire().unwrap_err();
        assert!(matches!(err, DdosError::ConnectionRefused { active: 3, max: 3 }));

        drop(permits);
        assert_eq!(limiter.active(), 0);
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn test_stats() {
        let limiter = Arc::new(ConnectionLimiter::from_config(&ConnectionConfig {
            max_connections: 1,
        }));
        let held = limiter.try_acquire().unwrap();
        let _ = limiter.try_acquire();
        let _ = limiter.try_acquire();

        let stats = limiter.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.max, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.refused, 2);
        drop(held);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let limiter = Arc::new(ConnectionLimiter::new(16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(permit) = limiter.try_acquire() {
                            assert!(limiter.active() <= 16);
                            drop(permit);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.active(), 0);
    }
}
