//! Structured protection events.
//!
//! The pipeline never persists or ships these itself. It hands each
//! [`ProtectionEvent`] to an [`EventSink`]; the default [`TracingSink`]
//! writes them as structured `tracing` records and [`BroadcastSink`] fans
//! them out to any in-process collector.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::circuit::CircuitState;
use crate::rate_limit::EndpointTier;

/// A state transition or rejection produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProtectionEvent {
    /// An IP crossed the violation threshold and was banned.
    BanApplied {
        /// Banned IP.
        ip: IpAddr,
        /// Violations counted in the window that triggered the ban.
        violations: u32,
        /// When the ban expires.
        until: DateTime<Utc>,
    },
    /// An operator lifted a ban.
    BanLifted {
        /// Unbanned IP.
        ip: IpAddr,
    },
    /// The circuit breaker opened.
    CircuitOpened {
        /// Threshold that tripped the breaker.
        reason: String,
        /// In-flight requests at trip time.
        concurrent: u64,
        /// Requests in the current second at trip time.
        rps: u64,
    },
    /// The open timeout elapsed and trial requests are being admitted.
    CircuitHalfOpened,
    /// A trial request succeeded and normal admission resumed.
    CircuitClosed,
    /// One fingerprint was seen from too many IPs or too many times.
    DistributedAttackDetected {
        /// Short fingerprint hash.
        fingerprint: String,
        /// Distinct IPs seen in the window.
        distinct_ips: usize,
        /// Requests seen in the window.
        requests: u64,
    },
    /// A request was rejected for its User-Agent.
    SuspiciousAgentBlocked {
        /// Caller IP.
        ip: IpAddr,
        /// Offending User-Agent.
        user_agent: String,
    },
    /// A request was rejected by one of the per-request layers.
    RequestRejected {
        /// Caller IP.
        ip: IpAddr,
        /// Rejection label.
        reason: &'static str,
        /// Tier of the request, when known.
        tier: Option<EndpointTier>,
        /// Circuit state, for overload rejections.
        circuit: Option<CircuitState>,
    },
    /// A transport connection was refused at accept time.
    ConnectionRefused {
        /// Peer address.
        peer: SocketAddr,
        /// Active connections at refusal time.
        active: usize,
        /// Configured ceiling.
        max: usize,
    },
}

impl ProtectionEvent {
    /// Event name, matching the serialized tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BanApplied { .. } => "ban_applied",
            Self::BanLifted { .. } => "ban_lifted",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened => "circuit_half_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::DistributedAttackDetected { .. } => "distributed_attack_detected",
            Self::SuspiciousAgentBlocked { .. } => "suspicious_agent_blocked",
            Self::RequestRejected { .. } => "request_rejected",
            Self::ConnectionRefused { .. } => "connection_refused",
        }
    }
}

/// Consumer of protection events.
///
/// Implementations are called on the request path and must not block.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Handle one event.
    fn emit(&self, event: ProtectionEvent);
}

/// Writes events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProtectionEvent) {
        let name = event.name();
        match event {
            ProtectionEvent::BanApplied { ip, violations, until } => {
                warn!(event = name, ip = %ip, violations, until = %until, "IP banned");
            }
            ProtectionEvent::BanLifted { ip } => {
                info!(event = name, ip = %ip, "IP ban lifted");
            }
            ProtectionEvent::CircuitOpened { reason, concurrent, rps } => {
                warn!(event = name, reason = %reason, concurrent, rps, "Circuit breaker opened");
            }
            ProtectionEvent::CircuitHalfOpened => {
                info!(event = name, "Circuit breaker half-open, admitting trial requests");
            }
            ProtectionEvent::CircuitClosed => {
                info!(event = name, "Circuit breaker closed");
            }
            ProtectionEvent::DistributedAttackDetected {
                fingerprint,
                distinct_ips,
                requests,
            } => {
                warn!(
                    event = name,
                    fingerprint = %fingerprint,
                    distinct_ips,
                    requests,
                    "Distributed attack pattern detected"
                );
            }
            ProtectionEvent::SuspiciousAgentBlocked { ip, user_agent } => {
                warn!(event = name, ip = %ip, user_agent = %user_agent, "Suspicious User-Agent blocked");
            }
            ProtectionEvent::RequestRejected {
                ip,
                reason,
                tier,
                circuit,
            } => {
                info!(
                    event = name,
                    ip = %ip,
                    reason,
                    tier = ?tier,
                    circuit = ?circuit,
                    "Request rejected"
                );
            }
            ProtectionEvent::ConnectionRefused { peer, active, max } => {
                warn!(event = name, peer = %peer, active, max, "Connection refused");
            }
        }
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Slow subscribers lag and lose events rather than slowing admission.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProtectionEvent>,
}

impl BroadcastSink {
    /// Create a sink with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProtectionEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ProtectionEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Forwards every event to several sinks in order.
#[derive(Debug, Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ProtectionEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Collects events for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<ProtectionEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<ProtectionEvent> {
            self.events.lock().clone()
        }

        pub(crate) fn count(&self, name: &str) -> usize {
            self.events.lock().iter().filter(|e| e.name() == name).count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: ProtectionEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ProtectionEvent::BanLifted {
            ip: "10.0.0.1".parse().unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ban_lifted");
        assert_eq!(json["ip"], "10.0.0.1");
        assert_eq!(event.name(), "ban_lifted");
    }

    #[test]
    fn test_rejection_event_serializes_tier() {
        let event = ProtectionEvent::RequestRejected {
            ip: "10.0.0.1".parse().unwrap(),
            reason: "rate-limited",
            tier: Some(EndpointTier::Auth),
            circuit: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tier"], "auth");
        assert!(json["circuit"].is_null());
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.emit(ProtectionEvent::CircuitHalfOpened);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, ProtectionEvent::CircuitHalfOpened);
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::new(4);
        sink.emit(ProtectionEvent::CircuitClosed);
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.emit(ProtectionEvent::CircuitClosed);

        assert_eq!(a.count("circuit_closed"), 1);
        assert_eq!(b.events(), vec![ProtectionEvent::CircuitClosed]);
    }

    #[test]
    fn test_tracing_sink_accepts_all_variants() {
        let sink = TracingSink;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        sink.emit(ProtectionEvent::BanApplied {
            ip,
            violations: 10,
            until: Utc::now(),
        });
        sink.emit(ProtectionEvent::SuspiciousAgentBlocked {
            ip,
            user_agent: "sqlmap/1.7".into(),
        });
        sink.emit(ProtectionEvent::ConnectionRefused {
            peer: "10.0.0.1:5000".parse().unwrap(),
            active: 3,
            max: 3,
        });
    }
}
