//! Parsed certificates.
//!
//! # Responsibilities
//! - Parse PEM (leaf + chain, private key, optional CA bundle)
//! - Extract SAN DNS names and IP addresses, validity window
//! - Answer "does this certificate serve this SNI name"
//!
//! A [`Certificate`] never changes after parsing; updates replace it.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::CertificateDer;
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use x509_parser::extensions::GeneralName;

use crate::tls::CertError;

/// Raw PEM input of a certificate, kept for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBundle {
    pub cert: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub ca: Option<Vec<u8>>,
}

impl PemBundle {
    pub fn new(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert: cert.into(),
            key: Some(key.into()),
            ca: None,
        }
    }

    pub fn with_ca(mut self, ca: impl Into<Vec<u8>>) -> Self {
        self.ca = Some(ca.into());
        self
    }
}

/// One X.509 leaf with its chain and, usually, its private key.
pub struct Certificate {
    pem: PemBundle,
    chain: Vec<CertificateDer<'static>>,
    certified_key: Option<Arc<CertifiedKey>>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Certificate {
    /// Parse a certificate. The CA bundle, if any, is appended to the chain
    /// presented to clients.
    pub fn from_pem(pem: PemBundle) -> Result<Self, CertError> {
        let mut chain = parse_certs(&pem.cert)?;
        let leaf = chain.first().cloned().ok_or(CertError::NoCertificate)?;
        if let Some(ca) = &pem.ca {
            chain.extend(parse_certs(ca)?);
        }

        let (_, x509) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| CertError::X509(e.to_string()))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Some(san) = x509
            .subject_alternative_name()
            .map_err(|e| CertError::X509(e.to_string()))?
        {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_ascii_lowercase()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let validity = x509.validity();
        let not_before = asn1_time(validity.not_before.timestamp())?;
        let not_after = asn1_time(validity.not_after.timestamp())?;

        let certified_key = match &pem.key {
            Some(key) => {
                let key = rustls_pemfile::private_key(&mut key.as_slice())
                    .map_err(|e| CertError::Pem(e.to_string()))?
                    .ok_or(CertError::NoPrivateKey)?;
                let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
                    .map_err(|e| CertError::Key(e.to_string()))?;
                Some(Arc::new(CertifiedKey::new(chain.clone(), signing_key)))
            }
            None => None,
        };

        Ok(Self {
            pem,
            chain,
            certified_key,
            dns_names,
            ip_addresses,
            not_before,
            not_after,
        })
    }

    pub fn pem(&self) -> &PemBundle {
        &self.pem
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The signing material handed to rustls; `None` without a private key.
    pub fn certified_key(&self) -> Option<&Arc<CertifiedKey>> {
        self.certified_key.as_ref()
    }

    pub fn has_key(&self) -> bool {
        self.certified_key.is_some()
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// Whether a SAN covers `server_name`.
    ///
    /// `*.example.com` covers exactly one extra label: `foo.example.com`
    /// matches, `example.com` and `a.b.example.com` do not. IP literals are
    /// matched against IP SANs only.
    pub fn matches_name(&self, server_name: &str) -> bool {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return false;
        }
        if let Ok(ip) = name.parse::<IpAddr>() {
            return self.ip_addresses.contains(&ip);
        }
        self.dns_names.iter().any(|san| dns_name_matches(san, &name))
    }

    /// Whether the key can sign with one of `schemes`. An empty list
    /// imposes no restriction.
    pub fn supports(&self, schemes: &[SignatureScheme]) -> bool {
        match &self.certified_key {
            Some(_) if schemes.is_empty() => true,
            Some(key) => key.key.choose_scheme(schemes).is_some(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("dns_names", &self.dns_names)
            .field("ip_addresses", &self.ip_addresses)
            .field("not_after", &self.not_after)
            .field("has_key", &self.has_key())
            .finish_non_exhaustive()
    }
}

/// The handshake facts certificate selection looks at.
#[derive(Debug, Clone, Default)]
pub struct HelloInfo {
    pub server_name: Option<String>,
    pub signature_schemes: Vec<SignatureScheme>,
}

impl HelloInfo {
    pub fn for_name(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            signature_schemes: Vec::new(),
        }
    }
}

impl From<&ClientHello<'_>> for HelloInfo {
    fn from(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_string),
            signature_schemes: hello.signature_schemes().to_vec(),
        }
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(CertError::NoCertificate);
    }
    Ok(certs)
}

fn dns_name_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    match pattern.strip_prefix("*.") {
        Some(suffix) => match name.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        },
        None => pattern == name,
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

fn asn1_time(timestamp: i64) -> Result<DateTime<Utc>, CertError> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| CertError::X509(format!("timestamp {timestamp} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::self_signed;

    #[test]
    fn wildcard_covers_one_label() {
        let (cert, key) = self_signed(&["*.example.com"]);
        let cert = Certificate::from_pem(PemBundle::new(cert, key)).unwrap();

        assert!(cert.matches_name("foo.example.com"));
        assert!(cert.matches_name("FOO.Example.com."));
        assert!(!cert.matches_name("example.com"));
        assert!(!cert.matches_name("a.b.example.com"));
        assert!(!cert.matches_name(".example.com"));
    }

    #[test]
    fn extracts_sans_and_validity() {
        let (cert, key) = self_signed(&["localhost", "127.0.0.1"]);
        let cert = Certificate::from_pem(PemBundle::new(cert, key)).unwrap();

        assert_eq!(cert.dns_names(), ["localhost"]);
        assert_eq!(cert.ip_addresses(), [IpAddr::from([127, 0, 0, 1])]);
        assert!(cert.matches_name("127.0.0.1"));
        assert!(!cert.matches_name("127.0.0.2"));
        assert!(cert.is_valid_at(Utc::now()));
        assert!(cert.has_key());
        assert!(cert.supports(&[]));
        assert!(cert.supports(&[SignatureScheme::ECDSA_NISTP256_SHA256]));
        assert!(!cert.supports(&[SignatureScheme::ED25519]));
    }

    #[test]
    fn ca_bundle_extends_chain() {
        let (cert, key) = self_signed(&["a.test"]);
        let (ca, _) = self_signed(&["ca.test"]);
        let cert = Certificate::from_pem(PemBundle::new(cert, key).with_ca(ca)).unwrap();
        assert_eq!(cert.chain().len(), 2);
        assert_eq!(cert.certified_key().unwrap().cert.len(), 2);
    }

    #[test]
    fn rejects_bad_input() {
        let err = Certificate::from_pem(PemBundle::new("not pem", "not pem")).unwrap_err();
        assert!(matches!(err, CertError::NoCertificate));

        let (cert, _) = self_signed(&["a.test"]);
        let err = Certificate::from_pem(PemBundle::new(cert.clone(), "junk")).unwrap_err();
        assert!(matches!(err, CertError::NoPrivateKey));

        let keyless = Certificate::from_pem(PemBundle {
            cert: cert.into_bytes(),
            key: None,
            ca: None,
        })
        .unwrap();
        assert!(!keyless.has_key());
        assert!(!keyless.supports(&[]));
    }
}
