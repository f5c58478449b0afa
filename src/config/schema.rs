//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::net::listener::DEFAULT_MAX_CONNECTIONS;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HotlineConfig {
    pub logging: LoggingConfig,

    pub certificates: CertificatesConfig,

    /// Listeners, each with its own protocol and TLS mode.
    pub entrypoints: Vec<EntryPointConfig>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Certificate sources, polled every `refresh_secs`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificatesConfig {
    pub refresh_secs: u64,

    pub files: Vec<FileCertConfig>,

    pub urls: Vec<UrlCertConfig>,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 10,
            files: Vec::new(),
            urls: Vec::new(),
        }
    }
}

impl CertificatesConfig {
    /// Every configured certificate name, files first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.urls.iter().map(|u| u.name.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.urls.is_empty()
    }
}

/// A certificate read from PEM files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileCertConfig {
    pub name: String,

    pub cert_path: String,

    pub key_path: String,

    #[serde(default)]
    pub ca_path: Option<String>,
}

/// A certificate fetched as JSON over HTTP.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UrlCertConfig {
    pub name: String,

    pub url: String,
}

/// TLS handling of an entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsSetting {
    /// Plaintext only.
    #[default]
    Disabled,
    /// TLS when the client starts a handshake, plaintext otherwise.
    Optional,
    /// Plaintext connections are rejected.
    Required,
}

/// One listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntryPointConfig {
    pub name: String,

    /// `[scheme://]host:port`, scheme defaults to `http`.
    pub address: String,

    #[serde(default)]
    pub tls: TlsSetting,

    /// Certificates this entrypoint may present; empty means all.
    #[serde(default)]
    pub certificates: Vec<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: HotlineConfig = toml::from_str(
            r#"
            [[entrypoints]]
            name = "web"
            address = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.certificates.refresh_secs, 10);
        let web = &config.entrypoints[0];
        assert_eq!(web.tls, TlsSetting::Disabled);
        assert!(web.certificates.is_empty());
        assert_eq!(web.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn full_config_parses() {
        let config: HotlineConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
            json = true

            [certificates]
            refresh_secs = 5

            [[certificates.files]]
            name = "site"
            cert_path = "/etc/hotline/site.crt"
            key_path = "/etc/hotline/site.key"
            ca_path = "/etc/hotline/ca.crt"

            [[certificates.urls]]
            name = "remote"
            url = "https://vault.internal/certs/remote"

            [[entrypoints]]
            name = "web"
            address = "http://0.0.0.0:8443"
            tls = "required"
            certificates = ["site"]
            max_connections = 100
            "#,
        )
        .unwrap();

        assert!(config.logging.json);
        assert_eq!(
            config.certificates.names().collect::<Vec<_>>(),
            vec!["site", "remote"]
        );
        assert_eq!(config.certificates.files[0].ca_path.as_deref(), Some("/etc/hotline/ca.crt"));
        assert_eq!(config.entrypoints[0].tls, TlsSetting::Required);
        assert_eq!(config.entrypoints[0].max_connections, 100);
    }
}
