//! Push-to-pull connection adapter.
//!
//! A [`Forwarder`] is the handler side: the accept loop pushes connections
//! into it. The paired [`ForwardingListener`] is the listener side: a
//! protocol server (axum, a second [`Server`](crate::server::Server)) pulls
//! from it as if it were a bound socket.

use std::io;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handler::Handler;
use crate::net::{Addr, Conn};
use crate::server::ServerError;

/// Default number of connections buffered between the two halves.
pub const DEFAULT_BACKLOG: usize = 128;

/// State both halves see.
#[derive(Debug, Default)]
struct Exit {
    error: OnceLock<ServerError>,
    signalled: CancellationToken,
}

impl Exit {
    fn fire(&self, err: ServerError) {
        if self.error.set(err).is_ok() {
            self.signalled.cancel();
        }
    }

    fn error(&self) -> Option<ServerError> {
        self.error.get().cloned()
    }
}

/// The pushing half: a [`Handler`] that queues connections.
#[derive(Debug, Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<Conn>,
    exit: Arc<Exit>,
}

/// The pulling half: a listener fed by a [`Forwarder`].
pub struct ForwardingListener {
    addr: Addr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    exit: Arc<Exit>,
    on_close: Option<Box<dyn Fn() + Send + Sync>>,
    on_exit: Option<CancellationToken>,
}

impl ForwardingListener {
    /// Create a connected pair. `addr` is reported as the listener's local
    /// address; `backlog` bounds the queue (at least one slot).
    pub fn new(addr: Addr, backlog: usize) -> (Forwarder, ForwardingListener) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        let exit = Arc::new(Exit::default());
        let forwarder = Forwarder {
            tx,
            exit: exit.clone(),
        };
        let listener = ForwardingListener {
            addr,
            rx: tokio::sync::Mutex::new(rx),
            exit,
            on_close: None,
            on_exit: None,
        };
        (forwarder, listener)
    }

    /// Register a callback run on every [`close`](crate::net::Listener::close).
    pub fn with_on_close<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Cancel `token` when the axum side of this listener hits a terminal
    /// error, including the [`Forwarder`] being dropped.
    pub fn with_exit_signal(mut self, token: CancellationToken) -> Self {
        self.on_exit = Some(token);
        self
    }
}

impl std::fmt::Debug for ForwardingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingListener")
            .field("addr", &self.addr)
            .field("exited", &self.exit.error.get().is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for Forwarder {
    /// Queue the connection. Waits while the queue is full.
    async fn on_connection(&self, conn: Conn) {
        let connection_id = conn.id();
        tokio::select! {
            sent = self.tx.send(conn) => {
                if sent.is_err() {
                    tracing::debug!(connection_id = %connection_id, "Forwarding listener gone, dropping connection");
                }
            }
            _ = self.exit.signalled.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Forwarding listener exited, dropping connection");
            }
        }
    }

    async fn on_server_exit(&self, err: &ServerError) {
        self.exit.fire(err.clone());
    }

    async fn on_shutdown(&self, _token: &CancellationToken) {}
}

#[async_trait]
impl crate::net::Listener for ForwardingListener {
    /// The next forwarded connection, or the forwarded terminal error.
    ///
    /// Once an error has been returned every later call returns it again.
    async fn accept(&self) -> Result<Conn, ServerError> {
        if let Some(err) = self.exit.error() {
            return Err(err);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(ServerError::ListenerClosed),
            _ = self.exit.signalled.cancelled() => {
                Err(self.exit.error().unwrap_or(ServerError::ListenerClosed))
            }
        }
    }

    fn local_addr(&self) -> Addr {
        self.addr.clone()
    }

    /// Runs the close callback. Queued connections stay queued.
    fn close(&self) {
        if let Some(on_close) = &self.on_close {
            on_close();
        }
    }
}

impl axum::serve::Listener for ForwardingListener {
    type Io = Conn;
    type Addr = Addr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match crate::net::Listener::accept(&*self).await {
            Ok(conn) => {
                let peer = conn.peer_addr().clone();
                (conn, peer)
            }
            Err(err) => {
                // axum cannot be told about a terminal error; its graceful
                // shutdown signal ends the serve loop instead.
                if !err.is_listener_closed() {
                    tracing::debug!(address = %self.addr, error = %err, "Forwarding listener exited");
                }
                if let Some(token) = &self.on_exit {
                    token.cancel();
                }
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.addr.clone())
    }
}
