//! TLS sniffing connection wrapper.
//!
//! Lets one listening port serve TLS and plaintext clients side by side. The
//! first byte of the stream decides: a TLS handshake record (`0x16`) or an
//! SSLv2-style client hello (`0x80`) is handed to rustls, anything else stays
//! plaintext (or is rejected when TLS is required).
//!
//! # States
//! ```text
//! Unsniffed ──0x16/0x80──▶ Handshaking ──ok──▶ Tls
//!     │                        └──err──▶ Failed
//!     ├──other byte──▶ Plain            (TLS optional)
//!     ├──other byte──▶ Failed(NotTls)   (TLS required)
//!     ├──eof──▶ Eof
//!     └──read error──▶ Failed
//! ```
//!
//! The sniff runs lazily on the first non-empty read (or the first write) and
//! exactly once. The peeked byte is replayed ahead of the stream, so nothing
//! is lost to the application. Failures are cached: every later read or
//! write sees the same error without touching the socket again.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use crate::net::addr::Addr;
use crate::net::conn::Stream;
use crate::net::tls::TlsMode;

/// Record type of a TLS handshake record.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// First byte of an SSLv2-compatible client hello. A heuristic, not proof.
pub const SSLV2_CLIENT_HELLO: u8 = 0x80;

/// Whether a first byte announces a TLS client.
pub fn looks_like_tls(first: u8) -> bool {
    first == TLS_HANDSHAKE_RECORD || first == SSLV2_CLIENT_HELLO
}

/// Why a sniffed connection is unusable.
#[derive(Debug, Clone, Error)]
pub enum SniffError {
    /// A plaintext client connected while TLS is required.
    #[error("plaintext connection rejected: TLS is required")]
    NotTls,

    #[error("failed to read first byte: {0}")]
    Read(#[source] Arc<io::Error>),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] Arc<io::Error>),
}

impl SniffError {
    fn to_io_error(&self) -> io::Error {
        let kind = match self {
            SniffError::NotTls => io::ErrorKind::ConnectionRefused,
            SniffError::Read(err) | SniffError::Handshake(err) => err.kind(),
        };
        io::Error::new(kind, self.clone())
    }
}

/// Extract the sniff failure carried by an I/O error, if any.
pub fn sniff_error(err: &io::Error) -> Option<&SniffError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<SniffError>())
}

/// Whether an I/O error is the forced-TLS rejection of a plaintext client.
pub fn is_not_tls(err: &io::Error) -> bool {
    matches!(sniff_error(err), Some(SniffError::NotTls))
}

/// One byte of lookahead in front of a stream.
#[derive(Debug)]
pub struct Rewind<S> {
    pending: Option<u8>,
    io: S,
}

impl<S> Rewind<S> {
    fn new(io: S, first: u8) -> Self {
        Self {
            pending: Some(first),
            io,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if let Some(first) = self.pending.take() {
            buf.put_slice(&[first]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

enum State<S> {
    Unsniffed(S),
    Handshaking(Accept<Rewind<S>>),
    Plain(Rewind<S>),
    Tls(Box<TlsStream<Rewind<S>>>),
    /// The peer closed before sending anything.
    Eof,
    Failed(SniffError),
    /// Only observable if a poll panicked mid-transition.
    Poisoned,
}

/// A connection that decides between TLS and plaintext on its first byte.
pub struct SniffStream<S> {
    state: State<S>,
    acceptor: Option<TlsAcceptor>,
    required: bool,
    peer_addr: Option<Addr>,
}

impl<S> SniffStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, mode: &TlsMode) -> Self {
        Self {
            state: State::Unsniffed(io),
            acceptor: mode.config().cloned().map(TlsAcceptor::from),
            required: mode.is_required(),
            peer_addr: None,
        }
    }

    /// Peer address used in log lines.
    pub fn with_peer_addr(mut self, peer_addr: Addr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Whether the first byte has been inspected.
    pub fn is_sniffed(&self) -> bool {
        !matches!(self.state, State::Unsniffed(_))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.state, State::Tls(_))
    }

    /// The TLS session once the handshake completed.
    pub fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        match &self.state {
            State::Tls(tls) => Some(tls.get_ref().1),
            _ => None,
        }
    }

    fn classify(&self, io: S, first: u8) -> State<S> {
        let io = Rewind::new(io, first);
        if looks_like_tls(first) {
            if let Some(acceptor) = &self.acceptor {
                return State::Handshaking(acceptor.accept(io));
            }
            return State::Plain(io);
        }

        if self.required {
            tracing::warn!(
                peer_addr = ?self.peer_addr,
                first_byte = first,
                "Rejecting plaintext connection: TLS is required"
            );
            // `io` is dropped here, closing the connection.
            return State::Failed(SniffError::NotTls);
        }

        State::Plain(io)
    }

    /// Drive the state machine until the connection is usable or failed.
    fn poll_establish(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let state = std::mem::replace(&mut self.state, State::Poisoned);
            self.state = match state {
                State::Unsniffed(mut io) => {
                    let mut first = [0u8; 1];
                    let mut buf = ReadBuf::new(&mut first);
                    let polled = Pin::new(&mut io).poll_read(cx, &mut buf);
                    let peeked = buf.filled().first().copied();
                    match polled {
                        Poll::Pending => {
                            self.state = State::Unsniffed(io);
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(e)) => {
                            tracing::debug!(peer_addr = ?self.peer_addr, error = %e, "Failed to sniff connection");
                            State::Failed(SniffError::Read(Arc::new(e)))
                        }
                        Poll::Ready(Ok(())) => match peeked {
                            Some(first) => self.classify(io, first),
                            None => State::Eof,
                        },
                    }
                }
                State::Handshaking(mut accept) => {
                    let polled = Pin::new(&mut accept).poll(cx);
                    match polled {
                        Poll::Pending => {
                            self.state = State::Handshaking(accept);
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(tls)) => {
                            tracing::debug!(
                                peer_addr = ?self.peer_addr,
                                sni = ?tls.get_ref().1.server_name(),
                                "TLS handshake completed"
                            );
                            State::Tls(Box::new(tls))
                        }
                        Poll::Ready(Err(e)) => {
                            tracing::debug!(peer_addr = ?self.peer_addr, error = %e, "TLS handshake failed");
                            State::Failed(SniffError::Handshake(Arc::new(e)))
                        }
                    }
                }
                State::Failed(err) => {
                    let io_err = err.to_io_error();
                    self.state = State::Failed(err);
                    return Poll::Ready(Err(io_err));
                }
                ready @ (State::Plain(_) | State::Tls(_) | State::Eof) => {
                    self.state = ready;
                    return Poll::Ready(Ok(()));
                }
                State::Poisoned => {
                    return Poll::Ready(Err(io::Error::other("connection state poisoned")));
                }
            };
        }
    }
}

impl<S> AsyncRead for SniffStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Spurious empty reads must not consume the peek byte.
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        ready!(this.poll_establish(cx))?;
        match &mut this.state {
            State::Plain(io) => Pin::new(io).poll_read(cx, buf),
            State::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl<S> AsyncWrite for SniffStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_establish(cx))?;
        match &mut this.state {
            State::Plain(io) => Pin::new(io).poll_write(cx, buf),
            State::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
            _ => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Unsniffed(io) => Pin::new(io).poll_flush(cx),
            State::Plain(io) => Pin::new(io).poll_flush(cx),
            State::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Unsniffed(io) => Pin::new(io).poll_shutdown(cx),
            State::Plain(io) => Pin::new(io).poll_shutdown(cx),
            State::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl<S> Stream for SniffStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn tls_connection(&self) -> Option<&rustls::ServerConnection> {
        SniffStream::tls_connection(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub(crate) fn tls_pair() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert: CertificateDer<'static> = generated.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));

        let server = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (Arc::new(server), Arc::new(client))
    }

    #[tokio::test]
    async fn plaintext_keeps_first_byte() {
        let (server_cfg, _) = tls_pair();
        for mode in [TlsMode::Disabled, TlsMode::Optional(server_cfg)] {
            let (mut client, server) = duplex(1024);
            let mut sniffed = SniffStream::new(server, &mode);

            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            drop(client);

            let mut received = Vec::new();
            sniffed.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"GET / HTTP/1.1\r\n");
            assert!(!sniffed.is_tls());
            assert!(sniffed.tls_connection().is_none());
        }
    }

    #[tokio::test]
    async fn required_tls_rejects_plaintext() {
        let (server_cfg, _) = tls_pair();
        let (mut client, server) = duplex(1024);
        let mut sniffed = SniffStream::new(server, &TlsMode::Required(server_cfg));

        client.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let err = sniffed.read(&mut buf).await.unwrap_err();
        assert!(is_not_tls(&err));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        // cached, no new I/O
        let again = sniffed.read(&mut buf).await.unwrap_err();
        assert!(is_not_tls(&again));
        assert!(sniffed.write_all(b"x").await.is_err());

        // the server side was dropped, so the client sees the close
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_read_does_not_sniff() {
        let (mut client, server) = duplex(1024);
        let mut sniffed = SniffStream::new(server, &TlsMode::Disabled);

        let mut empty = [0u8; 0];
        assert_eq!(sniffed.read(&mut empty).await.unwrap(), 0);
        assert!(!sniffed.is_sniffed());

        client.write_all(&[0xFF]).await.unwrap();
        let mut one = [0u8; 1];
        sniffed.read_exact(&mut one).await.unwrap();
        assert_eq!(one, [0xFF]);
        assert!(sniffed.is_sniffed());
    }

    #[tokio::test]
    async fn eof_before_first_byte() {
        let (client, server) = duplex(1024);
        let mut sniffed = SniffStream::new(server, &TlsMode::Disabled);
        drop(client);

        let mut buf = [0u8; 8];
        assert_eq!(sniffed.read(&mut buf).await.unwrap(), 0);
        assert_eq!(sniffed.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tls_client_is_terminated() {
        let (server_cfg, client_cfg) = tls_pair();
        let (client_io, server_io) = duplex(64 * 1024);
        let mut sniffed = SniffStream::new(server_io, &TlsMode::Optional(server_cfg));

        let client = tokio::spawn(async move {
            let connector = TlsConnector::from(client_cfg);
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, client_io).await.unwrap();
            tls.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            tls.read_exact(&mut reply).await.unwrap();
            reply
        });

        let mut buf = [0u8; 4];
        sniffed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(sniffed.is_tls());
        let session = sniffed.tls_connection().unwrap();
        assert_eq!(session.server_name(), Some("localhost"));

        sniffed.write_all(b"pong").await.unwrap();
        sniffed.flush().await.unwrap();
        assert_eq!(&client.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn sslv2_byte_attempts_handshake() {
        let (server_cfg, _) = tls_pair();
        let (mut client, server) = duplex(1024);
        let mut sniffed = SniffStream::new(server, &TlsMode::Optional(server_cfg));

        client.write_all(&[SSLV2_CLIENT_HELLO, 0x01, 0x02, 0x03]).await.unwrap();
        drop(client);

        let mut buf = [0u8; 8];
        let err = sniffed.read(&mut buf).await.unwrap_err();
        assert!(matches!(sniff_error(&err), Some(SniffError::Handshake(_))));
        assert!(!sniffed.is_tls());
    }

    #[test]
    fn classifies_first_bytes() {
        assert!(looks_like_tls(0x16));
        assert!(looks_like_tls(0x80));
        for byte in (0u8..=255).filter(|b| *b != 0x16 && *b != 0x80) {
            assert!(!looks_like_tls(byte));
        }
    }
}
