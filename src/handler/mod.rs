//! Connection handler subsystem.
//!
//! # Data Flow
//! ```text
//! Server accept loop
//!     → Handler::on_connection(conn)
//!         → middleware.rs (composed chain, lock-free snapshot)
//!             → switchable.rs (optional indirection, swapped at runtime)
//!                 → terminal handler (FnHandler, HttpHandler, forwarding.rs, ...)
//!
//! Server exit:     Handler::on_server_exit(err)
//! Server shutdown: Handler::on_shutdown(token)
//! ```
//!
//! # Design Decisions
//! - A handler owns what it is given; `on_connection` only has to *take*
//!   the connection, not finish serving it
//! - Every mutable indirection publishes through `arc-swap`, so the
//!   connection path never takes a lock

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::net::Conn;
use crate::server::ServerError;

pub mod forwarding;
pub mod middleware;
pub mod switchable;

pub use forwarding::{Forwarder, ForwardingListener};
pub use middleware::{Middleware, MiddlewareError, MiddlewareManager};
pub use switchable::SwitchableHandler;

/// The capability set every server handler provides.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Take ownership of an accepted connection.
    ///
    /// Called from the accept loop: implementations hand the connection off
    /// (spawn, enqueue) instead of serving it inline.
    async fn on_connection(&self, conn: Conn);

    /// The accept loop ended with `err`. Called once per server run.
    async fn on_server_exit(&self, err: &ServerError);

    /// The server is shutting down. `token` is cancelled when the caller's
    /// patience runs out.
    async fn on_shutdown(&self, token: &CancellationToken);
}

/// A handler shared between servers, middleware and switch points.
pub type SharedHandler = Arc<dyn Handler>;

/// A terminal handler that spawns a task per connection.
///
/// Panics inside the task are contained by the task boundary and logged.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn shared(f: F) -> SharedHandler {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_connection(&self, conn: Conn) {
        let connection_id = conn.id();
        let fut = (self.f)(conn);
        tokio::spawn(async move {
            catch_panic("connection", fut).await;
            tracing::trace!(connection_id = %connection_id, "Connection task finished");
        });
    }

    async fn on_server_exit(&self, _err: &ServerError) {}

    async fn on_shutdown(&self, _token: &CancellationToken) {}
}

/// Closes every connection it receives.
///
/// Used as the standby side of a health gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectHandler;

#[async_trait]
impl Handler for RejectHandler {
    async fn on_connection(&self, conn: Conn) {
        tracing::debug!(connection_id = %conn.id(), peer_addr = %conn.peer_addr(), "Rejecting connection");
        drop(conn);
    }

    async fn on_server_exit(&self, _err: &ServerError) {}

    async fn on_shutdown(&self, _token: &CancellationToken) {}
}

/// Run `fut`, turning a panic into a logged error.
///
/// Returns `None` when the future panicked.
pub async fn catch_panic<F>(unit: &'static str, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Some(output),
        Err(payload) => {
            let backtrace = std::backtrace::Backtrace::force_capture();
            tracing::error!(
                unit,
                panic = %panic_message(payload.as_ref()),
                backtrace = %backtrace,
                "Recovered from panic"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::Addr;
    use parking_lot::Mutex;

    /// Records every callback it sees, tagged with `name`.
    pub(crate) struct Recorder {
        pub name: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn on_connection(&self, _conn: Conn) {
            self.log.lock().push(format!("{}:conn", self.name));
        }

        async fn on_server_exit(&self, _err: &ServerError) {
            self.log.lock().push(format!("{}:exit", self.name));
        }

        async fn on_shutdown(&self, _token: &CancellationToken) {
            self.log.lock().push(format!("{}:shutdown", self.name));
        }
    }

    pub(crate) fn test_conn() -> Conn {
        let (_client, server) = tokio::io::duplex(64);
        Conn::new(
            server,
            Addr::Virtual("test".into()),
            Addr::Virtual("peer".into()),
        )
    }

    #[tokio::test]
    async fn catch_panic_recovers() {
        let out = catch_panic("test", async { panic!("boom") }).await;
        assert!(out.is_none());
        let out = catch_panic("test", async { 7 }).await;
        assert_eq!(out, Some(7));
    }

    #[tokio::test]
    async fn fn_handler_spawns_per_connection() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = FnHandler::shared(move |conn: Conn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn.id());
            }
        });

        let conn = test_conn();
        let id = conn.id();
        handler.on_connection(conn).await;
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn panicking_connection_task_is_contained() {
        let handler = FnHandler::shared(|_conn: Conn| async move { panic!("handler bug") });
        handler.on_connection(test_conn()).await;
        tokio::task::yield_now().await;
        // the handler keeps working afterwards
        handler.on_connection(test_conn()).await;
    }
}
