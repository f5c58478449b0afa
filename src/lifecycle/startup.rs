//! Startup orchestration.
//!
//! # Responsibilities
//! - Build certificate providers from configuration and poll them once
//! - Bind every entrypoint, with a filtered certificate view when TLS is on
//! - Install the protocol handler for each entrypoint
//! - Start background tasks (provider loops) and the accept loops
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Nothing is spawned until every entrypoint is bound
//! - Listeners start last (traffic only when ready)

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EntryPointConfig, HotlineConfig, TlsSetting};
use crate::handler::middleware::{self, Middleware};
use crate::handler::{FnHandler, Handler, RejectHandler, SharedHandler};
use crate::http::HttpHandler;
use crate::net::Conn;
use crate::server::{EntryPoint, EntryPointError, EntryPointManager};
use crate::tls::provider::{FileProvider, FileSource, ProviderError, UrlProvider, UrlSource};
use crate::tls::{CertError, CertManager, CertStore};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error(transparent)]
    EntryPoint(#[from] EntryPointError),
}

/// A running instance: certificates, providers and entrypoints.
#[derive(Debug)]
pub struct Hotline {
    pub(super) certificates: Arc<CertManager>,
    pub(super) entrypoints: Arc<EntryPointManager>,
    pub(super) file_provider: Arc<FileProvider>,
    pub(super) url_provider: Arc<UrlProvider>,
    pub(super) providers: CancellationToken,
    pub(super) provider_tasks: Vec<JoinHandle<()>>,
}

impl Hotline {
    pub fn certificates(&self) -> &Arc<CertManager> {
        &self.certificates
    }

    pub fn entrypoints(&self) -> &Arc<EntryPointManager> {
        &self.entrypoints
    }

    pub fn file_provider(&self) -> &Arc<FileProvider> {
        &self.file_provider
    }

    pub fn url_provider(&self) -> &Arc<UrlProvider> {
        &self.url_provider
    }
}

/// Bring up everything `config` describes.
pub async fn start(config: &HotlineConfig) -> Result<Hotline, StartupError> {
    let certificates = Arc::new(CertManager::new());
    let interval = Duration::from_secs(config.certificates.refresh_secs);

    let file_provider = Arc::new(FileProvider::new("file", certificates.clone(), interval));
    for cert in &config.certificates.files {
        let mut source = FileSource::new(&cert.cert_path, &cert.key_path);
        if let Some(ca_path) = &cert.ca_path {
            source = source.with_ca(ca_path);
        }
        file_provider.track(&cert.name, source)?;
    }

    let url_provider = Arc::new(UrlProvider::new("url", certificates.clone(), interval));
    if !config.certificates.urls.is_empty() {
        let client = UrlSource::client()?;
        for cert in &config.certificates.urls {
            url_provider.track(&cert.name, UrlSource::new(&cert.url, client.clone())?)?;
        }
    }

    // first poll inline so TLS entrypoints have certificates when they open
    file_provider.refresh().await;
    url_provider.refresh().await;
    tracing::info!(certificates = certificates.len(), "Certificates loaded");

    let entrypoints = Arc::new(EntryPointManager::new());
    for ep in &config.entrypoints {
        entrypoints.add(bind_entrypoint(ep, &certificates).await?)?;
    }

    let providers = CancellationToken::new();
    let provider_tasks = vec![
        {
            let provider = file_provider.clone();
            let token = providers.child_token();
            tokio::spawn(async move { provider.run(token).await })
        },
        {
            let provider = url_provider.clone();
            let token = providers.child_token();
            tokio::spawn(async move { provider.run(token).await })
        },
    ];

    entrypoints.spawn_all()?;
    tracing::info!(entrypoints = ?entrypoints.names(), "Hotline started");

    Ok(Hotline {
        certificates,
        entrypoints,
        file_provider,
        url_provider,
        providers,
        provider_tasks,
    })
}

async fn bind_entrypoint(
    config: &EntryPointConfig,
    certificates: &CertManager,
) -> Result<EntryPoint, StartupError> {
    let mut builder = EntryPoint::builder(&config.name, &config.address)
        .handler(Arc::new(RejectHandler))
        .middleware(access_log())
        .max_connections(config.max_connections);

    if config.tls != TlsSetting::Disabled {
        let store = CertStore::for_names(
            certificates,
            format!("entrypoint:{}", config.name),
            &config.certificates,
        )?;
        builder = builder.certificates(Arc::new(store), config.tls == TlsSetting::Required);
    }

    let entrypoint = builder.bind().await?;
    let handler: SharedHandler = match entrypoint.address().scheme() {
        "http" => Arc::new(HttpHandler::new(default_router(), entrypoint.local_addr())),
        _ => echo_handler(),
    };
    entrypoint.set_handler(handler);
    Ok(entrypoint)
}

/// Routes served on `http` entrypoints.
pub fn default_router() -> Router {
    Router::new()
        .route("/", get(|| async { "hotline" }))
        .route("/health", get(|| async { "OK" }))
}

/// Handler for raw `tcp` and `unix` entrypoints: echoes every byte back.
pub fn echo_handler() -> SharedHandler {
    FnHandler::shared(|mut conn: Conn| async move {
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Connection read failed");
                    break;
                }
            }
        }
    })
}

fn access_log() -> Middleware {
    middleware::from_fn("access-log", 0, |conn: Conn, next: SharedHandler| async move {
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %conn.peer_addr(),
            local_addr = %conn.local_addr(),
            tls = conn.is_tls(),
            "Connection accepted"
        );
        next.on_connection(conn).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::net::Addr;
    use tokio::net::TcpStream;

    fn tcp(ep: &EntryPoint) -> std::net::SocketAddr {
        match ep.local_addr() {
            Addr::Tcp(addr) => addr,
            other => panic!("unexpected address {other:?}"),
        }
    }

    #[tokio::test]
    async fn starts_http_and_tcp_entrypoints() {
        let config = parse_config(
            r#"
            [[entrypoints]]
            name = "web"
            address = "127.0.0.1:0"

            [[entrypoints]]
            name = "echo"
            address = "tcp://127.0.0.1:0"
            "#,
        )
        .unwrap();
        let hotline = start(&config).await.unwrap();
        assert_eq!(hotline.entrypoints().names(), vec!["echo", "web"]);

        let web = hotline.entrypoints().get("web").unwrap();
        let body = reqwest::get(format!("http://{}/health", tcp(&web)))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        let echo = hotline.entrypoints().get("echo").unwrap();
        let mut client = TcpStream::connect(tcp(&echo)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        hotline.shutdown(Duration::from_secs(5)).await;
        assert!(TcpStream::connect(tcp(&echo)).await.is_err());
    }

    #[tokio::test]
    async fn missing_certificate_files_leave_tls_without_certificates() {
        let config = parse_config(
            r#"
            [[certificates.files]]
            name = "site"
            cert_path = "/nonexistent/site.crt"
            key_path = "/nonexistent/site.key"

            [[entrypoints]]
            name = "secure"
            address = "tcp://127.0.0.1:0"
            tls = "optional"
            "#,
        )
        .unwrap();
        let hotline = start(&config).await.unwrap();
        assert!(hotline.certificates().is_empty());
        assert_eq!(hotline.file_provider().names(), vec!["site"]);
        assert!(hotline.entrypoints().get("secure").unwrap().tls_mode().is_enabled());
        hotline.shutdown(Duration::from_secs(5)).await;
    }
}
