//! Server configuration.
//!
//! Settings are layered, lowest precedence first:
//! - built-in defaults
//! - a TOML file
//! - environment variables and command-line flags ([`ConfigOverrides`])

use std::net::SocketAddr;
use std::path::Path;

use clap::Args;
use clap::builder::BoolishValueParser;
use rampart_ddos::{DdosConfig, EndpointTier, TierLimit};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

const fn default_trust_forwarded_headers() -> bool {
    true
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Resolve the client IP from `X-Forwarded-For` / `X-Real-IP`.
    ///
    /// Only safe behind a proxy that overwrites these headers.
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,
    /// Path serving the protection statistics as JSON, if any.
    #[serde(default)]
    pub stats_path: Option<String>,
    /// Admission pipeline settings.
    #[serde(default)]
    pub ddos: DdosConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
            stats_path: None,
            ddos: DdosConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is invalid.
    pub fn validate(&self) -> ServerResult<()> {
        if let Some(path) = &self.stats_path {
            if !path.starts_with('/') {
                return Err(ServerError::Config(format!(
                    "stats_path must start with '/', got '{path}'"
                )));
            }
        }

        self.ddos.validate()?;
        Ok(())
    }

    /// Set the bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set whether forwarded headers are trusted.
    #[must_use]
    pub fn with_trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Serve statistics on `path`.
    #[must_use]
    pub fn with_stats_path(mut self, path: impl Into<String>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    /// Replace the admission pipeline settings.
    #[must_use]
    pub fn with_ddos(mut self, ddos: DdosConfig) -> Self {
        self.ddos = ddos;
        self
    }
}

/// Overrides read from flags or the environment.
///
/// Every field is optional; unset fields leave the file or default value alone.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Listen address
    #[arg(long, env = "RAMPART_BIND")]
    pub bind: Option<SocketAddr>,

    /// Violations within the window that trigger a ban
    #[arg(long, env = "IP_BLOCK_MAX_VIOLATIONS")]
    pub ip_block_max_violations: Option<u32>,

    /// Ban length in minutes
    #[arg(long, env = "IP_BLOCK_DURATION_MINUTES")]
    pub ip_block_duration_minutes: Option<u64>,

    /// Violation counting window in minutes
    #[arg(long, env = "IP_BLOCK_VIOLATION_WINDOW_MINUTES")]
    pub ip_block_violation_window_minutes: Option<u64>,

    /// In-flight requests that open the circuit
    #[arg(long, env = "CIRCUIT_MAX_CONCURRENT")]
    pub circuit_max_concurrent: Option<u64>,

    /// Requests per second that open the circuit
    #[arg(long, env = "CIRCUIT_MAX_RPS")]
    pub circuit_max_rps: Option<u64>,

    /// Seconds the circuit stays open
    #[arg(long, env = "CIRCUIT_OPEN_TIMEOUT_SECONDS")]
    pub circuit_open_timeout_seconds: Option<u64>,

    /// Maximum open connections
    #[arg(long, env = "MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Auth tier sustained rate
    #[arg(long, env = "RATE_LIMIT_AUTH_RPS")]
    pub rate_limit_auth_rps: Option<f64>,

    /// Auth tier burst
    #[arg(long, env = "RATE_LIMIT_AUTH_BURST")]
    pub rate_limit_auth_burst: Option<u32>,

    /// Standard tier sustained rate
    #[arg(long, env = "RATE_LIMIT_STANDARD_RPS")]
    pub rate_limit_standard_rps: Option<f64>,

    /// Standard tier burst
    #[arg(long, env = "RATE_LIMIT_STANDARD_BURST")]
    pub rate_limit_standard_burst: Option<u32>,

    /// Expensive tier sustained rate
    #[arg(long, env = "RATE_LIMIT_EXPENSIVE_RPS")]
    pub rate_limit_expensive_rps: Option<f64>,

    /// Expensive tier burst
    #[arg(long, env = "RATE_LIMIT_EXPENSIVE_BURST")]
    pub rate_limit_expensive_burst: Option<u32>,

    /// Webhook tier sustained rate
    #[arg(long, env = "RATE_LIMIT_WEBHOOK_RPS")]
    pub rate_limit_webhook_rps: Option<f64>,

    /// Webhook tier burst
    #[arg(long, env = "RATE_LIMIT_WEBHOOK_BURST")]
    pub rate_limit_webhook_burst: Option<u32>,

    /// Requests per fingerprint window before flagging
    #[arg(long, env = "FINGERPRINT_MAX_REQUESTS")]
    pub fingerprint_max_requests: Option<u64>,

    /// Fingerprint window in minutes
    #[arg(long, env = "FINGERPRINT_WINDOW_MINUTES")]
    pub fingerprint_window_minutes: Option<u64>,

    /// Distinct IPs per fingerprint before flagging
    #[arg(long, env = "FINGERPRINT_SUSPICIOUS_THRESHOLD")]
    pub fingerprint_suspicious_threshold: Option<usize>,

    /// Reject requests from known tool and scraper user agents
    #[arg(long, env = "BLOCK_SUSPICIOUS_AGENTS", value_parser = BoolishValueParser::new())]
    pub block_suspicious_agents: Option<bool>,
}

impl ConfigOverrides {
    /// Apply every set override to `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }

        let ddos = &mut config.ddos;
        set(&mut ddos.ip_block.max_violations, self.ip_block_max_violations);
        set(&mut ddos.ip_block.block_duration_minutes, self.ip_block_duration_minutes);
        set(
            &mut ddos.ip_block.violation_window_minutes,
            self.ip_block_violation_window_minutes,
        );

        set(&mut ddos.circuit.max_concurrent, self.circuit_max_concurrent);
        set(&mut ddos.circuit.max_rps, self.circuit_max_rps);
        set(&mut ddos.circuit.open_timeout_secs, self.circuit_open_timeout_seconds);

        set(&mut ddos.connection.max_connections, self.max_connections);

        let tiers = [
            (EndpointTier::Auth, self.rate_limit_auth_rps, self.rate_limit_auth_burst),
            (EndpointTier::Standard, self.rate_limit_standard_rps, self.rate_limit_standard_burst),
            (EndpointTier::Expensive, self.rate_limit_expensive_rps, self.rate_limit_expensive_burst),
            (EndpointTier::Webhook, self.rate_limit_webhook_rps, self.rate_limit_webhook_burst),
        ];
        for (tier, rps, burst) in tiers {
            if let Some(limit) = ddos.rate_limit.limit_for_mut(tier) {
                override_tier(limit, rps, burst);
            }
        }

        set(&mut ddos.fingerprint.max_requests, self.fingerprint_max_requests);
        set(&mut ddos.fingerprint.window_minutes, self.fingerprint_window_minutes);
        set(
            &mut ddos.fingerprint.suspicious_threshold,
            self.fingerprint_suspicious_threshold,
        );
        set(
            &mut ddos.fingerprint.block_suspicious_agents,
            self.block_suspicious_agents,
        );
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn override_tier(limit: &mut TierLimit, rps: Option<f64>, burst: Option<u32>) {
    set(&mut limit.rps, rps);
    set(&mut limit.burst, burst);
}
