//! Server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::serve::ListenerExt;
use rampart_ddos::{DdosProtection, EventSink, TracingSink, spawn_sweeper};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::listener::LimitedListener;
use crate::middleware::ProtectionState;
use crate::routes::create_router;

/// HTTP server with the admission pipeline in front of every route.
#[derive(Debug, Clone)]
pub struct RampartServer {
    config: ServerConfig,
    protection: Arc<DdosProtection>,
}

impl RampartServer {
    /// Create a server that logs protection events through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_events(config, Arc::new(TracingSink))
    }

    /// Create a server that reports protection events to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_events(config: ServerConfig, events: Arc<dyn EventSink>) -> ServerResult<Self> {
        config.validate()?;
        let protection = Arc::new(DdosProtection::with_events(config.ddos.clone(), events)?);
        Ok(Self { config, protection })
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared admission pipeline.
    #[must_use]
    pub fn protection(&self) -> Arc<DdosProtection> {
        Arc::clone(&self.protection)
    }

    /// Create the router without starting the server.
    ///
    /// Useful for testing or embedding in another server.
    pub fn router(&self) -> axum::Router {
        let state = ProtectionState::new(self.protection(), self.config.trust_forwarded_headers);
        create_router(state, self.config.stats_path.as_deref())
    }

    /// Start the server and listen on the configured address.
    ///
    /// Runs until the server encounters a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve(&self) -> ServerResult<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server stops accepting connections when `shutdown` completes and
    /// returns once in-flight requests have finished.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;

        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let listener = LimitedListener::new(listener, self.protection()).tap_io(|_| {});
        let _sweeper = spawn_sweeper(self.protection(), self.config.ddos.sweep.interval());

        info!(
            addr = %addr,
            max_connections = self.config.ddos.connection.max_connections,
            "Rampart listening"
        );
        if forwarded_headers_exposed(self.config.trust_forwarded_headers, addr) {
            warn!(
                addr = %addr,
                "Trusting X-Forwarded-For on a non-loopback address; clients can choose their own IP"
            );
        }

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Rampart shut down");
        Ok(())
    }
}

/// Whether clients can reach the listener directly while forwarding headers
/// are trusted.
fn forwarded_headers_exposed(trust_forwarded_headers: bool, addr: SocketAddr) -> bool {
    trust_forwarded_headers && !addr.ip().is_loopback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_ddos::DdosConfig;

    #[test]
    fn test_server_creation() {
        let server = RampartServer::new(ServerConfig::default()).unwrap();
        assert!(server.config().trust_forwarded_headers);
        assert_eq!(server.protection().stats().banned_ips, 0);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut ddos = DdosConfig::default();
        ddos.ip_block.max_violations = 0;
        let result = RampartServer::new(ServerConfig::default().with_ddos(ddos));
        assert!(matches!(result, Err(ServerError::Ddos(_))));
    }

    #[test]
    fn test_overflowing_ban_duration_is_fatal() {
        let mut ddos = DdosConfig::default();
        ddos.ip_block.block_duration_minutes = u64::MAX / 60;
        let result = RampartServer::new(ServerConfig::default().with_ddos(ddos));
        assert!(matches!(result, Err(ServerError::Ddos(_))));
    }

    #[test]
    fn test_forwarded_headers_exposure() {
        let public: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let loopback_v6: SocketAddr = "[::1]:8080".parse().unwrap();

        assert!(forwarded_headers_exposed(true, public));
        assert!(!forwarded_headers_exposed(false, public));
        assert!(!forwarded_headers_exposed(true, loopback));
        assert!(!forwarded_headers_exposed(true, loopback_v6));
    }

    #[test]
    fn test_clone_shares_protection() {
        let server = RampartServer::new(ServerConfig::default()).unwrap();
        let cloned = server.clone();

        server.protection().ban("192.0.2.9".parse().unwrap(), None);
        assert!(cloned.protection().is_banned("192.0.2.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let server =
            RampartServer::new(ServerConfig::default().with_bind_addr(addr)).unwrap();
        let err = server.serve_with_shutdown(async {}).await.unwrap_err();
        assert!(matches!(err, ServerError::BindFailed(a, _) if a == addr));
    }
}
