//! The accept loop.
//!
//! # State Transitions
//! ```text
//! Created → Running:       start()
//! Running → ShuttingDown:  shutdown() (listener closed, accept loop ends)
//! ShuttingDown → Stopped:  handler and callbacks done
//! Created → ShuttingDown:  shutdown() before start(); start() then fails
//! ```
//!
//! Stopped is terminal; a server is never restarted.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::handler::{catch_panic, SharedHandler};
use crate::net::{Conn, ConnectionTracker, Listener, SniffStream, TlsMode};
use crate::server::ServerError;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl From<u8> for ServerState {
    fn from(v: u8) -> Self {
        match v {
            0 => ServerState::Created,
            1 => ServerState::Running,
            2 => ServerState::ShuttingDown,
            _ => ServerState::Stopped,
        }
    }
}

type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// A listener, a TLS mode and a handler.
///
/// `start` runs the accept loop on the calling task; `shutdown` may be called
/// from anywhere, any number of times.
pub struct Server {
    listener: Box<dyn Listener>,
    handler: SharedHandler,
    tls: ArcSwap<TlsMode>,
    tracker: ConnectionTracker,
    state: AtomicU8,
    stopped: AtomicBool,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl Server {
    pub fn new<L: Listener>(listener: L, handler: SharedHandler) -> Self {
        Self::from_boxed(Box::new(listener), handler)
    }

    pub fn from_boxed(listener: Box<dyn Listener>, handler: SharedHandler) -> Self {
        Self {
            listener,
            handler,
            tls: ArcSwap::from_pointee(TlsMode::Disabled),
            tracker: ConnectionTracker::new(),
            state: AtomicU8::new(ServerState::Created as u8),
            stopped: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tls_mode(self, mode: TlsMode) -> Self {
        self.set_tls_mode(mode);
        self
    }

    /// The TLS mode applied to connections accepted from now on.
    pub fn tls_mode(&self) -> Arc<TlsMode> {
        self.tls.load_full()
    }

    /// Change the TLS mode. Safe while the accept loop runs; connections
    /// already accepted keep the mode they were accepted with.
    pub fn set_tls_mode(&self, mode: TlsMode) {
        self.tls.store(Arc::new(mode));
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    pub fn local_addr(&self) -> crate::net::Addr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::Acquire))
    }

    /// Connections accepted by this server that are still open.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn connection_tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Register callbacks to run at the end of [`shutdown`](Self::shutdown),
    /// last registered first. Callbacks registered after shutdown never run.
    pub fn on_shutdown<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Run the accept loop until the listener fails or is closed.
    ///
    /// Returns `Ok(())` when the loop ended because the listener was closed,
    /// the terminal error otherwise. Either way the handler has seen
    /// `on_server_exit` before this returns.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self
            .state
            .compare_exchange(
                ServerState::Created as u8,
                ServerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ServerError::AlreadyStarted);
        }

        let address = self.listener.local_addr();
        tracing::info!(address = %address, tls = self.tls.load().as_str(), "Server started");

        let err = loop {
            match self.listener.accept().await {
                Ok(conn) => self.dispatch(conn).await,
                Err(err) if err.is_transient() => {
                    tracing::debug!(address = %address, error = %err, "Transient accept error, retrying");
                    let delay = err.retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    if !err.is_listener_closed() {
                        tracing::error!(address = %address, error = %err, "Accept failed");
                    }
                    break err;
                }
            }
        };

        catch_panic("server_exit", self.handler.on_server_exit(&err)).await;
        tracing::debug!(address = %address, "Accept loop exited");

        if err.is_listener_closed() {
            Ok(())
        } else {
            Err(err)
        }
    }

    async fn dispatch(&self, conn: Conn) {
        let conn = conn.with_guard(self.tracker.track());
        let conn = {
            let tls = self.tls.load();
            if tls.is_enabled() {
                let peer_addr = conn.peer_addr().clone();
                conn.map_stream(|io| SniffStream::new(io, &tls).with_peer_addr(peer_addr))
            } else {
                conn
            }
        };
        catch_panic("on_connection", self.handler.on_connection(conn)).await;
    }

    /// Stop the server. Only the first call does anything.
    ///
    /// Closes the listener, waits for the handler's `on_shutdown` (which may
    /// watch `token`), then runs the shutdown callbacks in reverse order.
    pub async fn shutdown(&self, token: &CancellationToken) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state
            .store(ServerState::ShuttingDown as u8, Ordering::Release);

        let address = self.listener.local_addr();
        tracing::info!(
            address = %address,
            active_connections = self.tracker.active_count(),
            "Server shutting down"
        );

        self.listener.close();
        catch_panic("on_shutdown", self.handler.on_shutdown(token)).await;

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks.into_iter().rev() {
            callback();
        }

        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        tracing::info!(address = %address, "Server stopped");
    }

    /// [`shutdown`](Self::shutdown) without a deadline.
    pub async fn stop(&self) {
        self.shutdown(&CancellationToken::new()).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.listener.local_addr())
            .field("state", &self.state())
            .field("tls", &self.tls.load().as_str())
            .finish_non_exhaustive()
    }
}
