//! Certificate management subsystem.
//!
//! # Data Flow
//! ```text
//! provider/ (file mtime polling, URL JSON polling)
//!     → CertUpdater::add_certificate / del_certificate
//!         → manager.rs (name → Certificate, published snapshot)
//!             → updater fan-out (store.rs views, group.rs routing, ...)
//!
//! TLS handshake (rustls ResolvesServerCert)
//!     → snapshot scan: signature schemes, SNI vs SAN
//!     → CertifiedKey
//! ```
//!
//! # Design Decisions
//! - Writers serialize on one mutex; handshakes read an `arc-swap` snapshot
//! - Identical PEM input is a no-op, so pollers can push on every change of
//!   mtime without churning TLS state

use thiserror::Error;

pub mod certificate;
pub mod group;
pub mod manager;
pub mod provider;
pub mod store;
pub mod updater;

pub use certificate::{Certificate, HelloInfo, PemBundle};
pub use group::{CertKey, CertManagerGroup, GroupUpdater};
pub use manager::CertManager;
pub use store::CertStore;
pub use updater::{CertUpdater, UpdaterFilter};

/// Certificate parsing, registration and lookup errors.
#[derive(Debug, Clone, Error)]
pub enum CertError {
    #[error("certificate name must not be empty")]
    EmptyName,

    #[error("certificate {0:?} has no private key")]
    MissingKey(String),

    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("unsupported private key: {0}")]
    Key(String),

    #[error("invalid X.509 certificate: {0}")]
    X509(String),

    #[error("no certificate configured for {}", .server_name.as_deref().unwrap_or("<no SNI>"))]
    NoMatch { server_name: Option<String> },

    #[error("updater {0:?} is already registered")]
    DuplicateUpdater(String),
}
