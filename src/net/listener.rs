//! Listener implementations with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming connections
//! - Enforce max_connections limit via semaphore
//! - Close promptly: a blocked `accept` returns `ListenerClosed`

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::net::addr::Addr;
use crate::net::conn::{Conn, Stream};
use crate::server::ServerError;

/// Default cap on concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// A source of connections for a [`Server`](crate::server::Server).
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection.
    ///
    /// Returns [`ServerError::ListenerClosed`] once [`close`](Listener::close)
    /// has been called, including for calls already blocked.
    async fn accept(&self) -> Result<Conn, ServerError>;

    fn local_addr(&self) -> Addr;

    /// Stop accepting. Idempotent.
    fn close(&self);
}

/// A socket type the [`Acceptor`] can drive.
pub trait RawListener: Send + 'static {
    type Stream: Stream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Addr)>>;
}

impl RawListener for TcpListener {
    type Stream = TcpStream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, Addr)>> {
        TcpListener::poll_accept(self, cx).map_ok(|(stream, peer)| (stream, Addr::Tcp(peer)))
    }
}

#[cfg(unix)]
impl RawListener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(tokio::net::UnixStream, Addr)>> {
        tokio::net::UnixListener::poll_accept(self, cx).map_ok(|(stream, peer)| {
            let peer = match peer.as_pathname() {
                Some(path) => Addr::Unix(path.to_path_buf()),
                None => Addr::Virtual("unix-unnamed".to_string()),
            };
            (stream, peer)
        })
    }
}

/// A bound listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// `accept` waits until a slot becomes available; the permit travels with the
/// [`Conn`] and is released when the connection is dropped.
pub struct Acceptor<L> {
    inner: Mutex<Option<L>>,
    local_addr: Addr,
    closed: CancellationToken,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    unlink_on_close: Option<PathBuf>,
}

pub type TcpAcceptor = Acceptor<TcpListener>;

#[cfg(unix)]
pub type UnixAcceptor = Acceptor<tokio::net::UnixListener>;

impl<L: RawListener> Acceptor<L> {
    fn from_parts(listener: L, local_addr: Addr, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            inner: Mutex::new(Some(listener)),
            local_addr,
            closed: CancellationToken::new(),
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            unlink_on_close: None,
        }
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<(L::Stream, Addr), ServerError>> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(listener) => listener.poll_accept(cx).map_err(ServerError::accept),
            None => Poll::Ready(Err(ServerError::ListenerClosed)),
        }
    }
}

impl TcpAcceptor {
    /// Bind a TCP listener.
    pub async fn bind(address: &str, max_connections: usize) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::bind(address, e))?;
        Self::from_listener(listener, max_connections).map_err(|e| ServerError::bind(address, e))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener, max_connections: usize) -> io::Result<Self> {
        let local_addr: SocketAddr = listener.local_addr()?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self::from_parts(listener, Addr::Tcp(local_addr), max_connections))
    }
}

#[cfg(unix)]
impl UnixAcceptor {
    /// Bind a Unix domain socket. The socket file is removed again on close.
    pub fn bind(path: &str, max_connections: usize) -> Result<Self, ServerError> {
        let listener =
            tokio::net::UnixListener::bind(path).map_err(|e| ServerError::bind(path, e))?;

        tracing::info!(path, max_connections, "Unix listener bound");

        let mut acceptor =
            Self::from_parts(listener, Addr::Unix(PathBuf::from(path)), max_connections);
        acceptor.unlink_on_close = Some(PathBuf::from(path));
        Ok(acceptor)
    }
}

#[async_trait]
impl<L: RawListener> Listener for Acceptor<L> {
    async fn accept(&self) -> Result<Conn, ServerError> {
        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            permit = self.connection_limit.clone().acquire_owned() => {
                permit.map_err(|_| ServerError::ListenerClosed)?
            }
            _ = self.closed.cancelled() => return Err(ServerError::ListenerClosed),
        };

        let (stream, peer_addr) = tokio::select! {
            accepted = poll_fn(|cx| self.poll_accept(cx)) => accepted?,
            _ = self.closed.cancelled() => return Err(ServerError::ListenerClosed),
        };

        tracing::debug!(
            peer_addr = %peer_addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok(Conn::new(stream, self.local_addr.clone(), peer_addr).with_permit(permit))
    }

    fn local_addr(&self) -> Addr {
        self.local_addr.clone()
    }

    fn close(&self) {
        self.closed.cancel();
        if self.inner.lock().take().is_some() {
            if let Some(path) = &self.unlink_on_close {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
            tracing::debug!(address = %self.local_addr, "Listener closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn accepts_tcp_connections() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0", 4).await.unwrap();
        let addr = match acceptor.local_addr() {
            Addr::Tcp(addr) => addr,
            other => panic!("unexpected address {other:?}"),
        };

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let mut conn = acceptor.accept().await.unwrap();
        assert_eq!(acceptor.available_permits(), 3);
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();

        drop(conn);
        assert_eq!(acceptor.available_permits(), 4);
    }

    #[tokio::test]
    async fn close_unblocks_accept_and_releases_socket() {
        let acceptor = Arc::new(TcpAcceptor::bind("127.0.0.1:0", 4).await.unwrap());
        let addr = match acceptor.local_addr() {
            Addr::Tcp(addr) => addr,
            other => panic!("unexpected address {other:?}"),
        };

        let blocked = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        acceptor.close();
        acceptor.close();

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(ServerError::ListenerClosed)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_is_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotline.sock");
        let path_str = path.to_str().unwrap().to_string();

        let acceptor = UnixAcceptor::bind(&path_str, 1).unwrap();
        assert!(path.exists());

        let client = tokio::spawn({
            let path = path.clone();
            async move { tokio::net::UnixStream::connect(path).await.unwrap() }
        });
        let conn = acceptor.accept().await.unwrap();
        assert!(matches!(conn.local_addr(), Addr::Unix(_)));
        drop(client.await.unwrap());

        acceptor.close();
        assert!(!path.exists());
    }
}
