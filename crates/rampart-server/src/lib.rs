//! # rampart-server
//!
//! HTTP front end for the [`rampart_ddos`] admission pipeline, built on axum.
//!
//! - [`LimitedListener`] refuses connections over the ceiling at accept time
//! - [`middleware::protect`] evaluates every request and maps rejections to
//!   403, 429 or 503 responses
//! - [`RampartServer`] wires both together with a background sweeper and
//!   graceful shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use rampart_server::{RampartServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rampart_server::ServerError> {
//!     let server = RampartServer::new(ServerConfig::default())?;
//!     server
//!         .serve_with_shutdown(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Endpoints
//!
//! | Endpoint | Method | Tier |
//! |----------|--------|------|
//! | `/health` | GET | health (unlimited) |
//! | `/api/users` | GET | standard |
//! | `/api/auth/login` | POST | auth |
//! | `/api/reports/{name}` | GET | expensive |
//! | `/api/webhooks/{provider}` | POST | webhook |
//! | `stats_path`, if configured | GET | standard |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client_ip;
pub mod config;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod routes;
pub mod server;

// Re-export main types
pub use config::{ConfigOverrides, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use listener::{LimitedListener, LimitedStream};
pub use middleware::ProtectionState;
pub use server::RampartServer;
