//! axum behind a hot-swappable handler.
//!
//! # Responsibilities
//! - Accept connections from any server through a forwarding listener
//! - Run one `axum::serve` task over that listener
//! - Turn server exit and shutdown into axum graceful shutdown
//!
//! # Design Decisions
//! - The serve task starts with the handler, not with the first connection
//! - Shutdown waits for in-flight requests until the caller's token fires,
//!   then aborts the serve task
//! - Dropping the handler, e.g. after a swap, stops the serve task gracefully

use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::handler::forwarding::DEFAULT_BACKLOG;
use crate::handler::{Forwarder, ForwardingListener, Handler};
use crate::net::{Addr, Conn};
use crate::server::ServerError;

/// A [`Handler`] serving HTTP/1.1 and HTTP/2 with an axum [`Router`].
pub struct HttpHandler {
    address: Addr,
    forwarder: Forwarder,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpHandler {
    /// Spawn the serve task. Must be called inside a tokio runtime.
    pub fn new(router: Router, local_addr: Addr) -> Self {
        Self::with_backlog(router, local_addr, DEFAULT_BACKLOG)
    }

    pub fn with_backlog(router: Router, local_addr: Addr, backlog: usize) -> Self {
        let stop = CancellationToken::new();
        let (forwarder, listener) = ForwardingListener::new(local_addr.clone(), backlog);
        let listener = listener.with_exit_signal(stop.clone());
        let app = router.layer(TraceLayer::new_for_http());

        let signal = stop.clone();
        let address = local_addr.clone();
        let task = tokio::spawn(async move {
            tracing::info!(address = %address, "HTTP server starting");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            match served {
                Ok(()) => tracing::info!(address = %address, "HTTP server stopped"),
                Err(e) => tracing::error!(address = %address, error = %e, "HTTP server failed"),
            }
        });

        Self {
            address: local_addr,
            forwarder,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn local_addr(&self) -> &Addr {
        &self.address
    }

    /// Whether the serve task is still running.
    pub fn is_serving(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HttpHandler {
    /// A handler swapped out of a server still drains its open connections.
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler")
            .field("address", &self.address)
            .field("stopping", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn on_connection(&self, conn: Conn) {
        self.forwarder.on_connection(conn).await;
    }

    async fn on_server_exit(&self, err: &ServerError) {
        self.forwarder.on_server_exit(err).await;
        self.stop.cancel();
    }

    async fn on_shutdown(&self, token: &CancellationToken) {
        self.stop.cancel();
        let Some(mut task) = self.task.lock().take() else {
            return;
        };

        tokio::select! {
            _ = &mut task => {}
            _ = token.cancelled() => {
                tracing::warn!(address = %self.address, "HTTP server did not drain in time, aborting");
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpAcceptor;
    use crate::server::Server;
    use axum::routing::get;
    use std::sync::Arc;

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let listener = TcpAcceptor::bind("127.0.0.1:0", 16).await.unwrap();
        let addr = crate::net::Listener::local_addr(&listener);
        let Addr::Tcp(socket) = addr.clone() else {
            panic!("expected a TCP address");
        };

        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let http = Arc::new(HttpHandler::new(router, addr));
        let server = Arc::new(Server::new(listener, http.clone()));
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let body = reqwest::get(format!("http://{socket}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");
        assert!(http.is_serving());

        server.stop().await;
        assert!(running.await.unwrap().is_ok());
        assert!(!http.is_serving());
    }

    #[tokio::test]
    async fn swapped_out_handler_releases_its_router() {
        use crate::handler::{MiddlewareManager, RejectHandler};
        use std::time::Duration;

        let marker = Arc::new(());
        let router = {
            let marker = marker.clone();
            Router::new().route(
                "/",
                get(move || {
                    let _held = &marker;
                    async { "ok" }
                }),
            )
        };
        let manager = MiddlewareManager::new(Arc::new(HttpHandler::new(
            router,
            Addr::Virtual("swap".into()),
        )));
        assert!(Arc::strong_count(&marker) > 1);

        manager.set_handler(Arc::new(RejectHandler));
        tokio::time::timeout(Duration::from_secs(2), async {
            while Arc::strong_count(&marker) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("serve task kept the router alive");
    }

    #[tokio::test]
    async fn server_exit_stops_serving() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let http = HttpHandler::new(router, Addr::Virtual("test".into()));

        http.on_server_exit(&ServerError::ListenerClosed).await;
        http.on_shutdown(&CancellationToken::new()).await;
        assert!(!http.is_serving());
    }
}
