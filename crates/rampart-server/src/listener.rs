//! Connection-limited TCP listener.
//!
//! Wraps a [`TcpListener`] so that every accepted socket holds a
//! [`ConnectionPermit`] for as long as it stays open. Sockets arriving while
//! the ceiling is reached are closed immediately, before any HTTP parsing.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use rampart_ddos::{ConnectionPermit, DdosProtection};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Back-off after a non-connection accept error such as fd exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A listener that enforces the pipeline's connection ceiling.
#[derive(Debug)]
pub struct LimitedListener {
    inner: TcpListener,
    protection: Arc<DdosProtection>,
}

impl LimitedListener {
    /// Wrap a bound listener.
    pub fn new(inner: TcpListener, protection: Arc<DdosProtection>) -> Self {
        Self { inner, protection }
    }

    /// Accept the next connection that fits under the ceiling.
    async fn accept_limited(&mut self) -> (LimitedStream, SocketAddr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => match self.protection.admit_connection(peer) {
                    Ok(permit) => {
                        return (
                            LimitedStream {
                                stream,
                                _permit: permit,
                            },
                            peer,
                        );
                    }
                    // Dropping the stream closes it.
                    Err(_) => drop(stream),
                },
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed during accept");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl Listener for LimitedListener {
    type Io = LimitedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        self.accept_limited().await
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// An accepted socket holding a connection slot.
#[derive(Debug)]
pub struct LimitedStream {
    stream: TcpStream,
    _permit: ConnectionPermit,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
