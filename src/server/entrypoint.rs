//! Named, independently startable server units.
//!
//! An entrypoint ties together a listen address, a TLS mode, a middleware
//! manager around a terminal handler, and the [`Server`] that runs them.

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::server::ResolvesServerCert;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::handler::{Middleware, MiddlewareManager, SharedHandler};
use crate::net::listener::DEFAULT_MAX_CONNECTIONS;
use crate::net::tls::{server_config, HTTP_ALPN};
use crate::net::{Addr, ListenAddr, TlsMode};
use crate::server::registry::{BuildRequest, ProtocolRegistry};
use crate::server::{EntryPointError, Server, ServerError};

enum TlsSetup {
    Mode(TlsMode),
    Resolver {
        resolver: Arc<dyn ResolvesServerCert>,
        required: bool,
    },
}

/// Builder for [`EntryPoint`].
pub struct EntryPointBuilder {
    name: String,
    address: String,
    handler: Option<SharedHandler>,
    middlewares: Vec<Middleware>,
    tls: TlsSetup,
    max_connections: usize,
    registry: Option<Arc<ProtocolRegistry>>,
}

impl EntryPointBuilder {
    /// The terminal handler, innermost in the middleware chain.
    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls = TlsSetup::Mode(mode);
        self
    }

    /// Terminate TLS with certificates from `resolver`. With `required`,
    /// plaintext clients are turned away.
    pub fn certificates(mut self, resolver: Arc<dyn ResolvesServerCert>, required: bool) -> Self {
        self.tls = TlsSetup::Resolver { resolver, required };
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Build through `registry` instead of one with only the built-in schemes.
    pub fn registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the listener. The entrypoint is not accepting until started.
    pub async fn bind(self) -> Result<EntryPoint, EntryPointError> {
        if self.name.is_empty() {
            return Err(EntryPointError::EmptyName);
        }
        let handler = self
            .handler
            .ok_or_else(|| EntryPointError::MissingHandler(self.name.clone()))?;
        let address: ListenAddr = self.address.parse()?;

        let middlewares = Arc::new(MiddlewareManager::new(handler));
        middlewares.use_middlewares(self.middlewares)?;

        let tls_mode = match self.tls {
            TlsSetup::Mode(mode) => mode,
            TlsSetup::Resolver { resolver, required } => {
                let alpn: &[&[u8]] = if address.scheme() == "http" {
                    HTTP_ALPN
                } else {
                    &[]
                };
                TlsMode::new(Some(server_config(resolver, alpn)?), required)
            }
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProtocolRegistry::new()));
        let server = registry
            .build(BuildRequest {
                address: address.clone(),
                handler: middlewares.clone(),
                max_connections: self.max_connections,
            })
            .await?
            .with_tls_mode(tls_mode);

        tracing::info!(
            entrypoint = %self.name,
            address = %server.local_addr(),
            tls = server.tls_mode().as_str(),
            "Entrypoint bound"
        );

        Ok(EntryPoint {
            name: self.name,
            address,
            server: Arc::new(server),
            middlewares,
            task: Mutex::new(None),
        })
    }
}

/// A named server with its own middleware chain.
pub struct EntryPoint {
    name: String,
    address: ListenAddr,
    server: Arc<Server>,
    middlewares: Arc<MiddlewareManager>,
    task: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
}

impl EntryPoint {
    pub fn builder(name: impl Into<String>, address: impl Into<String>) -> EntryPointBuilder {
        EntryPointBuilder {
            name: name.into(),
            address: address.into(),
            handler: None,
            middlewares: Vec::new(),
            tls: TlsSetup::Mode(TlsMode::Disabled),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            registry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured listen address.
    pub fn address(&self) -> &ListenAddr {
        &self.address
    }

    /// The bound address (resolves port 0).
    pub fn local_addr(&self) -> Addr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn middlewares(&self) -> &MiddlewareManager {
        &self.middlewares
    }

    /// Replace the terminal handler; connections accepted from now on use it.
    pub fn set_handler(&self, handler: SharedHandler) {
        self.middlewares.set_handler(handler);
    }

    pub fn tls_mode(&self) -> Arc<TlsMode> {
        self.server.tls_mode()
    }

    pub fn set_tls_mode(&self, mode: TlsMode) {
        tracing::info!(entrypoint = %self.name, tls = mode.as_str(), "TLS mode changed");
        self.server.set_tls_mode(mode);
    }

    pub fn on_shutdown<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.server.on_shutdown(callback);
    }

    /// Run the accept loop on the calling task.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.server.start().await
    }

    /// Run the accept loop on a background task.
    pub fn spawn(&self) -> Result<(), EntryPointError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(ServerError::AlreadyStarted.into());
        }

        let server = self.server.clone();
        let name = self.name.clone();
        *task = Some(tokio::spawn(async move {
            let result = server.start().await;
            if let Err(err) = &result {
                tracing::error!(entrypoint = %name, error = %err, "Entrypoint stopped with error");
            }
            result
        }));
        Ok(())
    }

    /// Shut the server down and wait for a spawned accept loop to finish,
    /// giving up when `token` is cancelled.
    pub async fn shutdown(&self, token: &CancellationToken) {
        self.server.shutdown(token).await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            tokio::select! {
                _ = task => {}
                _ = token.cancelled() => {
                    tracing::warn!(entrypoint = %self.name, "Gave up waiting for accept loop");
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.shutdown(&CancellationToken::new()).await
    }

    /// Wait until every connection accepted by this entrypoint is closed.
    pub async fn drain(&self, token: &CancellationToken) -> bool {
        self.server.connection_tracker().wait_for_idle(token).await
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{middleware, FnHandler, Handler, RejectHandler};
    use crate::net::Conn;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn tcp_addr(ep: &EntryPoint) -> std::net::SocketAddr {
        match ep.local_addr() {
            Addr::Tcp(addr) => addr,
            other => panic!("unexpected address {other:?}"),
        }
    }

    fn reply(text: &'static [u8]) -> SharedHandler {
        FnHandler::shared(move |mut conn: Conn| async move {
            let _ = conn.write_all(text).await;
        })
    }

    async fn read_all(addr: std::net::SocketAddr) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn rejects_incomplete_builders() {
        let err = EntryPoint::builder("", "tcp://127.0.0.1:0")
            .handler(Arc::new(RejectHandler))
            .bind()
            .await;
        assert!(matches!(err, Err(EntryPointError::EmptyName)));

        let err = EntryPoint::builder("web", "tcp://127.0.0.1:0").bind().await;
        assert!(matches!(err, Err(EntryPointError::MissingHandler(name)) if name == "web"));

        let err = EntryPoint::builder("web", "tcp://")
            .handler(Arc::new(RejectHandler))
            .bind()
            .await;
        assert!(matches!(err, Err(EntryPointError::Address(_))));
    }

    #[tokio::test]
    async fn handler_swap_applies_to_new_connections() {
        let ep = EntryPoint::builder("raw", "tcp://127.0.0.1:0")
            .handler(reply(b"v1"))
            .middleware(middleware::from_fn("tag", 1, |mut conn: Conn, next| async move {
                let _ = conn.write_all(b"[").await;
                next.on_connection(conn).await;
            }))
            .bind()
            .await
            .unwrap();
        ep.spawn().unwrap();
        assert!(matches!(ep.spawn(), Err(EntryPointError::Server(ServerError::AlreadyStarted))));

        let addr = tcp_addr(&ep);
        assert_eq!(read_all(addr).await, b"[v1");

        ep.set_handler(reply(b"v2"));
        assert_eq!(read_all(addr).await, b"[v2");

        ep.middlewares().del("tag");
        assert_eq!(read_all(addr).await, b"v2");

        ep.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn drain_waits_for_open_connections() {
        let ep = EntryPoint::builder("hold", "tcp://127.0.0.1:0")
            .handler(FnHandler::shared(|mut conn: Conn| async move {
                let mut buf = [0u8; 1];
                let _ = conn.read(&mut buf).await;
            }))
            .bind()
            .await
            .unwrap();
        ep.spawn().unwrap();

        let client = TcpStream::connect(tcp_addr(&ep)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ep.server().active_connections(), 1);

        ep.stop().await;
        let token = CancellationToken::new();
        let drained = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(client);
                tokio::time::sleep(Duration::from_secs(2)).await;
                token.cancel();
            })
        };
        assert!(ep.drain(&token).await);
        drained.abort();
    }
}
