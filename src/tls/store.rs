//! Filtered certificate views.
//!
//! A [`CertStore`] is a private [`CertManager`] kept in sync with a subset of
//! a shared one. Each TLS configuration resolves against its own store, so an
//! entrypoint only ever presents the certificates it was given.

use std::collections::HashSet;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::tls::{CertError, CertManager, UpdaterFilter};

pub struct CertStore {
    updater_name: String,
    view: Arc<CertManager>,
}

impl CertStore {
    /// Subscribe a new view to `source`. The view starts with every matching
    /// certificate `source` already holds.
    pub fn attach(
        source: &CertManager,
        updater_name: impl Into<String>,
        filter: UpdaterFilter,
    ) -> Result<Self, CertError> {
        let updater_name = updater_name.into();
        let view = Arc::new(CertManager::new());
        source.add_filtered_updater(&updater_name, filter, view.clone())?;
        Ok(Self { updater_name, view })
    }

    /// A view of the certificates named in `names`; an empty list means all.
    pub fn for_names(
        source: &CertManager,
        updater_name: impl Into<String>,
        names: &[String],
    ) -> Result<Self, CertError> {
        let filter = if names.is_empty() {
            UpdaterFilter::All
        } else {
            UpdaterFilter::Names(names.iter().cloned().collect::<HashSet<_>>())
        };
        Self::attach(source, updater_name, filter)
    }

    /// Stop following `source`. The view keeps what it has.
    pub fn detach(&self, source: &CertManager) -> bool {
        source.del_updater(&self.updater_name)
    }

    pub fn certificates(&self) -> &CertManager {
        &self.view
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("updater", &self.updater_name)
            .field("certificates", &self.view.names())
            .finish()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.view.resolve(client_hello)
    }
}
