//! Scheme → listener builder registry.
//!
//! New protocols plug in by registering a builder under their scheme; the
//! entrypoint code never switches on scheme names itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::handler::SharedHandler;
use crate::net::{ListenAddr, TcpAcceptor};
use crate::server::{EntryPointError, Server};

/// What a protocol builder is asked to bind.
#[derive(Clone)]
pub struct BuildRequest {
    pub address: ListenAddr,
    pub handler: SharedHandler,
    pub max_connections: usize,
}

pub type BuildFuture = Pin<Box<dyn Future<Output = Result<Server, EntryPointError>> + Send>>;

type Builder = Arc<dyn Fn(BuildRequest) -> BuildFuture + Send + Sync>;

/// Maps listen-address schemes to server builders.
pub struct ProtocolRegistry {
    builders: RwLock<HashMap<String, Builder>>,
}

impl ProtocolRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            builders: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in schemes: `tcp` and `http` bind TCP,
    /// `unix` binds a Unix domain socket.
    pub fn new() -> Self {
        let registry = Self::empty();
        let builtin: [(&str, Builder); 2] = [
            ("tcp", Arc::new(bind_tcp)),
            ("http", Arc::new(bind_tcp)),
        ];
        let mut builders = registry.builders.write();
        for (scheme, builder) in builtin {
            builders.insert(scheme.to_string(), builder);
        }
        #[cfg(unix)]
        builders.insert("unix".to_string(), Arc::new(bind_unix));
        drop(builders);
        registry
    }

    /// Register a builder for `scheme`. Fails if the scheme is taken.
    pub fn register<F, Fut>(&self, scheme: &str, builder: F) -> Result<(), EntryPointError>
    where
        F: Fn(BuildRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Server, EntryPointError>> + Send + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        let mut builders = self.builders.write();
        if builders.contains_key(&scheme) {
            return Err(EntryPointError::DuplicateProtocol(scheme));
        }
        let builder: Builder = Arc::new(move |req: BuildRequest| Box::pin(builder(req)) as BuildFuture);
        builders.insert(scheme, builder);
        Ok(())
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.builders.read().contains_key(&scheme.to_ascii_lowercase())
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.builders.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Build a server for `req.address` with the builder of its scheme.
    pub async fn build(&self, req: BuildRequest) -> Result<Server, EntryPointError> {
        let builder = self
            .builders
            .read()
            .get(req.address.scheme())
            .cloned()
            .ok_or_else(|| EntryPointError::UnknownProtocol(req.address.scheme().to_string()))?;
        builder(req).await
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

fn bind_tcp(req: BuildRequest) -> BuildFuture {
    Box::pin(async move {
        let listener = TcpAcceptor::bind(req.address.address(), req.max_connections).await?;
        Ok(Server::new(listener, req.handler))
    })
}

#[cfg(unix)]
fn bind_unix(req: BuildRequest) -> BuildFuture {
    Box::pin(async move {
        let listener =
            crate::net::UnixAcceptor::bind(req.address.address(), req.max_connections)?;
        Ok(Server::new(listener, req.handler))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RejectHandler;
    use crate::net::listener::DEFAULT_MAX_CONNECTIONS;

    fn request(address: &str) -> BuildRequest {
        BuildRequest {
            address: address.parse().unwrap(),
            handler: Arc::new(RejectHandler),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    #[tokio::test]
    async fn builds_builtin_schemes() {
        let registry = ProtocolRegistry::new();
        assert!(registry.contains("TCP"));

        let server = registry.build(request("127.0.0.1:0")).await.unwrap();
        assert!(matches!(server.local_addr(), crate::net::Addr::Tcp(_)));

        let server = registry.build(request("tcp://127.0.0.1:0")).await.unwrap();
        assert!(matches!(server.local_addr(), crate::net::Addr::Tcp(_)));
    }

    #[tokio::test]
    async fn unknown_scheme_is_an_error() {
        let registry = ProtocolRegistry::new();
        let err = registry.build(request("quic://127.0.0.1:0")).await.unwrap_err();
        assert!(matches!(err, EntryPointError::UnknownProtocol(s) if s == "quic"));
    }

    #[tokio::test]
    async fn custom_protocols_register_once() {
        let registry = ProtocolRegistry::empty();
        registry
            .register("memory", |req: BuildRequest| async move {
                let (_forwarder, listener) = crate::handler::ForwardingListener::new(
                    crate::net::Addr::Virtual(req.address.address().to_string()),
                    1,
                );
                Ok::<_, EntryPointError>(Server::new(listener, req.handler))
            })
            .unwrap();

        let err = registry
            .register("MEMORY", |req: BuildRequest| async move {
                let listener = TcpAcceptor::bind(req.address.address(), 1).await?;
                Ok::<_, EntryPointError>(Server::new(listener, req.handler))
            })
            .unwrap_err();
        assert!(matches!(err, EntryPointError::DuplicateProtocol(_)));

        let server = registry.build(request("memory://queue")).await.unwrap();
        assert_eq!(server.local_addr(), crate::net::Addr::Virtual("queue".into()));
    }
}
