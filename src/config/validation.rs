//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (entrypoint allow-lists name real certificates)
//! - Validate value ranges (refresh interval > 0, known log levels)
//! - Detect duplicate names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HotlineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{HotlineConfig, TlsSetting};
use crate::net::ListenAddr;

/// Schemes the default protocol registry can build.
pub const KNOWN_SCHEMES: &[&str] = &["http", "tcp", "unix"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown log level {0:?}")]
    LogLevel(String),

    #[error("certificates.refresh_secs must be greater than zero")]
    RefreshInterval,

    #[error("certificate name must not be empty")]
    EmptyCertificateName,

    #[error("certificate {0:?} is defined more than once")]
    DuplicateCertificate(String),

    #[error("certificate {name:?}: invalid URL {url:?}")]
    CertificateUrl { name: String, url: String },

    #[error("entrypoint name must not be empty")]
    EmptyEntryPointName,

    #[error("entrypoint {0:?} is defined more than once")]
    DuplicateEntryPoint(String),

    #[error("entrypoint {name:?}: {reason}")]
    Address { name: String, reason: String },

    #[error("entrypoint {0:?} enables TLS but no certificates are configured")]
    TlsWithoutCertificates(String),

    #[error("entrypoint {entrypoint:?} references unknown certificate {certificate:?}")]
    UnknownCertificate {
        entrypoint: String,
        certificate: String,
    },

    #[error("entrypoint {0:?}: max_connections must be greater than zero")]
    MaxConnections(String),
}

pub fn validate_config(config: &HotlineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::LogLevel(config.logging.level.clone()));
    }

    let certs = &config.certificates;
    if certs.refresh_secs == 0 {
        errors.push(ValidationError::RefreshInterval);
    }

    let mut cert_names = HashSet::new();
    for name in certs.names() {
        if name.is_empty() {
            errors.push(ValidationError::EmptyCertificateName);
        } else if !cert_names.insert(name) {
            errors.push(ValidationError::DuplicateCertificate(name.to_string()));
        }
    }

    for source in &certs.urls {
        let valid = url::Url::parse(&source.url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !valid {
            errors.push(ValidationError::CertificateUrl {
                name: source.name.clone(),
                url: source.url.clone(),
            });
        }
    }

    let mut entrypoint_names = HashSet::new();
    for ep in &config.entrypoints {
        if ep.name.is_empty() {
            errors.push(ValidationError::EmptyEntryPointName);
        } else if !entrypoint_names.insert(ep.name.as_str()) {
            errors.push(ValidationError::DuplicateEntryPoint(ep.name.clone()));
        }

        match ep.address.parse::<ListenAddr>() {
            Ok(addr) if !KNOWN_SCHEMES.contains(&addr.scheme()) => {
                errors.push(ValidationError::Address {
                    name: ep.name.clone(),
                    reason: format!("unknown scheme {:?}", addr.scheme()),
                });
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::Address {
                name: ep.name.clone(),
                reason: e.to_string(),
            }),
        }

        if ep.tls != TlsSetting::Disabled && certs.is_empty() {
            errors.push(ValidationError::TlsWithoutCertificates(ep.name.clone()));
        }

        for cert in &ep.certificates {
            if !cert_names.contains(cert.as_str()) {
                errors.push(ValidationError::UnknownCertificate {
                    entrypoint: ep.name.clone(),
                    certificate: cert.clone(),
                });
            }
        }

        if ep.max_connections == 0 {
            errors.push(ValidationError::MaxConnections(ep.name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EntryPointConfig, FileCertConfig, UrlCertConfig};

    fn entrypoint(name: &str, address: &str) -> EntryPointConfig {
        EntryPointConfig {
            name: name.to_string(),
            address: address.to_string(),
            tls: TlsSetting::Disabled,
            certificates: Vec::new(),
            max_connections: 10,
        }
    }

    fn file_cert(name: &str) -> FileCertConfig {
        FileCertConfig {
            name: name.to_string(),
            cert_path: "cert.pem".to_string(),
            key_path: "key.pem".to_string(),
            ca_path: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        let mut config = HotlineConfig::default();
        config.certificates.files.push(file_cert("site"));
        let mut web = entrypoint("web", "127.0.0.1:8080");
        web.tls = TlsSetting::Optional;
        web.certificates = vec!["site".to_string()];
        config.entrypoints.push(web);
        config.entrypoints.push(entrypoint("raw", "tcp://127.0.0.1:9000"));

        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn reports_every_error() {
        let mut config = HotlineConfig::default();
        config.logging.level = "loud".to_string();
        config.certificates.refresh_secs = 0;
        config.certificates.files.push(file_cert("dup"));
        config.certificates.urls.push(UrlCertConfig {
            name: "dup".to_string(),
            url: "ftp://example.com/cert".to_string(),
        });
        let mut web = entrypoint("web", "gopher://127.0.0.1:70");
        web.certificates = vec!["nope".to_string()];
        web.max_connections = 0;
        config.entrypoints.push(web);
        config.entrypoints.push(entrypoint("web", "://broken"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::LogLevel("loud".to_string()),
                ValidationError::RefreshInterval,
                ValidationError::DuplicateCertificate("dup".to_string()),
                ValidationError::CertificateUrl {
                    name: "dup".to_string(),
                    url: "ftp://example.com/cert".to_string(),
                },
                ValidationError::Address {
                    name: "web".to_string(),
                    reason: "unknown scheme \"gopher\"".to_string(),
                },
                ValidationError::UnknownCertificate {
                    entrypoint: "web".to_string(),
                    certificate: "nope".to_string(),
                },
                ValidationError::MaxConnections("web".to_string()),
                ValidationError::DuplicateEntryPoint("web".to_string()),
                ValidationError::Address {
                    name: "web".to_string(),
                    reason: "listen address \"://broken\" has an empty scheme".to_string(),
                },
            ]
        );
    }

    #[test]
    fn tls_needs_a_certificate_source() {
        let mut config = HotlineConfig::default();
        let mut web = entrypoint("web", "127.0.0.1:8443");
        web.tls = TlsSetting::Required;
        config.entrypoints.push(web);

        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::TlsWithoutCertificates("web".to_string())])
        );
    }
}
