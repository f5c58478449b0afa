//! Certificates fetched as JSON over HTTP.
//!
//! The endpoint answers `GET` with `{"ca": "...", "key": "...", "cert": "..."}`,
//! each field a full PEM document. `ca` may be absent or empty.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::tls::provider::{CertProvider, CertSource, Polled, ProviderError};
use crate::tls::PemBundle;

pub type UrlProvider = CertProvider<UrlSource>;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct CertResponse {
    #[serde(default)]
    ca: Option<String>,
    key: String,
    cert: String,
}

impl From<CertResponse> for PemBundle {
    fn from(body: CertResponse) -> Self {
        let pem = PemBundle::new(body.cert, body.key);
        match body.ca {
            Some(ca) if !ca.trim().is_empty() => pem.with_ca(ca),
            _ => pem,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlSource {
    url: ::url::Url,
    client: reqwest::Client,
}

impl UrlSource {
    /// Only `http` and `https` URLs are accepted.
    pub fn new(url: &str, client: reqwest::Client) -> Result<Self, ProviderError> {
        let parsed = ::url::Url::parse(url).map_err(|source| ProviderError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self {
                url: parsed,
                client,
            }),
            other => Err(ProviderError::UnsupportedScheme(other.to_string())),
        }
    }

    /// A client suitable for sharing between sources.
    pub fn client() -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Fetch {
                url: String::new(),
                source,
            })
    }

    pub fn url(&self) -> &::url::Url {
        &self.url
    }

    async fn fetch(&self) -> Result<PemBundle, ProviderError> {
        let fetch_error = |source: reqwest::Error| ProviderError::Fetch {
            url: self.url.to_string(),
            source,
        };
        let body: CertResponse = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(fetch_error)?
            .json()
            .await
            .map_err(fetch_error)?;
        Ok(body.into())
    }
}

#[async_trait]
impl CertSource for UrlSource {
    type Mark = PemBundle;

    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn poll(&self, last: Option<&PemBundle>) -> Result<Polled<PemBundle>, ProviderError> {
        let pem = self.fetch().await?;
        if last == Some(&pem) {
            return Ok(Polled::Unchanged);
        }
        Ok(Polled::Changed(pem.clone(), pem))
    }
}
