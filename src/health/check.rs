//! Health probes.
//!
//! # Responsibilities
//! - Decide whether the service behind a gate can take traffic
//! - Bound every probe with a timeout; a timeout is a failure

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> bool;
}

/// Any async closure returning `bool` is a check.
#[async_trait]
impl<F, Fut> HealthCheck for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn check(&self) -> bool {
        (self)().await
    }
}

/// Healthy when a TCP connection can be opened.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for TcpCheck {
    async fn check(&self) -> bool {
        match time::timeout(self.timeout, tokio::net::TcpStream::connect(self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(addr = %self.addr, error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(addr = %self.addr, "Health check failed: timeout");
                false
            }
        }
    }
}

/// Healthy when a `GET` answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    async fn check(&self) -> bool {
        let request = self
            .client
            .get(&self.url)
            .header("user-agent", "hotline-health-check")
            .timeout(self.timeout);

        match request.send().await {
            Ok(response) => {
                let success = response.status().is_success();
                if !success {
                    tracing::warn!(url = %self.url, status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Err(e) if e.is_timeout() => {
                tracing::warn!(url = %self.url, "Health check failed: timeout");
                false
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Health check failed: connection error");
                false
            }
        }
    }
}
