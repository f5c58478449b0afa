//! The connection type handed to handlers.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;

use crate::net::addr::Addr;
use crate::net::connection::{ConnectionGuard, ConnectionId};

/// A byte stream a [`Conn`] can carry.
///
/// `tls_connection` is a capability query: only streams that terminated TLS
/// return the rustls session, everything else keeps the default `None`.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        None
    }
}

impl Stream for tokio::net::TcpStream {}

#[cfg(unix)]
impl Stream for tokio::net::UnixStream {}

impl Stream for tokio::io::DuplexStream {}

impl Stream for Box<dyn Stream> {
    fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        (**self).tls_connection()
    }
}

/// An accepted connection.
///
/// Carries the I/O stream plus bookkeeping that must live exactly as long as
/// the connection: the connection-limit permit and the tracker guard.
pub struct Conn {
    io: Box<dyn Stream>,
    id: ConnectionId,
    local_addr: Addr,
    peer_addr: Addr,
    guard: Option<ConnectionGuard>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Conn {
    pub fn new<S: Stream>(io: S, local_addr: Addr, peer_addr: Addr) -> Self {
        Self {
            io: Box::new(io),
            id: ConnectionId::new(),
            local_addr,
            peer_addr,
            guard: None,
            permit: None,
        }
    }

    /// Attach a tracker guard; the connection adopts the guard's id.
    pub fn with_guard(mut self, guard: ConnectionGuard) -> Self {
        self.id = guard.id();
        self.guard = Some(guard);
        self
    }

    pub(crate) fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &Addr {
        &self.peer_addr
    }

    /// The TLS session, if this connection terminated TLS.
    ///
    /// Before the first read or write of a sniffed connection this is always
    /// `None`; the protocol is not known yet.
    pub fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        self.io.tls_connection()
    }

    pub fn is_tls(&self) -> bool {
        self.tls_connection().is_some()
    }

    /// Replace the I/O stream with a wrapper around it, keeping the bookkeeping.
    pub fn map_stream<F, S>(self, f: F) -> Self
    where
        F: FnOnce(Box<dyn Stream>) -> S,
        S: Stream,
    {
        let Conn {
            io,
            id,
            local_addr,
            peer_addr,
            guard,
            permit,
        } = self;
        Conn {
            io: Box::new(f(io)),
            id,
            local_addr,
            peer_addr,
            guard,
            permit,
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Stream for Conn {
    fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        Conn::tls_connection(self)
    }
}
