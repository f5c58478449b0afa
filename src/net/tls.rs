//! TLS mode and server configuration.

use std::sync::Arc;

use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;

/// ALPN protocols offered by HTTP entrypoints.
pub const HTTP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// How a server treats TLS on its accepted connections.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Plaintext only; connections are never sniffed.
    #[default]
    Disabled,
    /// TLS clients are terminated, plaintext clients pass through.
    Optional(Arc<ServerConfig>),
    /// TLS clients are terminated, plaintext clients are rejected.
    Required(Arc<ServerConfig>),
}

impl TlsMode {
    /// Build a mode from a config and a force flag.
    pub fn new(config: Option<Arc<ServerConfig>>, force_tls: bool) -> Self {
        match (config, force_tls) {
            (None, _) => TlsMode::Disabled,
            (Some(config), false) => TlsMode::Optional(config),
            (Some(config), true) => TlsMode::Required(config),
        }
    }

    pub fn config(&self) -> Option<&Arc<ServerConfig>> {
        match self {
            TlsMode::Disabled => None,
            TlsMode::Optional(config) | TlsMode::Required(config) => Some(config),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }

    pub fn is_required(&self) -> bool {
        matches!(self, TlsMode::Required(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Disabled => "disabled",
            TlsMode::Optional(_) => "optional",
            TlsMode::Required(_) => "required",
        }
    }
}

/// Build a rustls server configuration that asks `resolver` for the
/// certificate on every handshake.
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::ClientHello;
    use rustls::sign::CertifiedKey;

    #[derive(Debug)]
    struct NoCert;

    impl ResolvesServerCert for NoCert {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    #[test]
    fn mode_from_config_and_flag() {
        assert!(matches!(TlsMode::new(None, true), TlsMode::Disabled));

        let config = server_config(Arc::new(NoCert), HTTP_ALPN).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let optional = TlsMode::new(Some(config.clone()), false);
        assert!(optional.is_enabled());
        assert!(!optional.is_required());
        assert_eq!(optional.as_str(), "optional");

        let required = TlsMode::new(Some(config), true);
        assert!(required.is_required());
        assert!(required.config().is_some());
    }
}
