//! The certificate registry.
//!
//! # Responsibilities
//! - Map certificate names to parsed certificates
//! - Publish a lock-free snapshot for handshakes
//! - Fan out changes to registered updaters
//! - Resolve certificates for rustls by SNI

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::tls::updater::FilteredUpdater;
use crate::tls::{CertError, CertUpdater, Certificate, HelloInfo, UpdaterFilter};

#[derive(Default)]
struct State {
    certs: BTreeMap<String, Arc<Certificate>>,
    updaters: HashMap<String, FilteredUpdater>,
}

/// Named certificates plus the snapshot TLS handshakes scan.
pub struct CertManager {
    state: Mutex<State>,
    snapshot: ArcSwap<Vec<Arc<Certificate>>>,
}

impl Default for CertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CertManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Add or replace a certificate.
    ///
    /// Returns `Ok(false)` without touching anything when `name` already
    /// holds byte-identical PEM input.
    pub fn add_certificate(
        &self,
        name: &str,
        cert: impl Into<Arc<Certificate>>,
    ) -> Result<bool, CertError> {
        let cert = cert.into();
        if name.is_empty() {
            return Err(CertError::EmptyName);
        }
        if !cert.has_key() {
            return Err(CertError::MissingKey(name.to_string()));
        }

        let mut state = self.state.lock();
        if let Some(existing) = state.certs.get(name) {
            if existing.pem() == cert.pem() {
                return Ok(false);
            }
        }

        let replaced = state.certs.insert(name.to_string(), cert.clone()).is_some();
        self.publish(&state);
        for updater in state.updaters.values() {
            updater.add_certificate(name, cert.clone());
        }

        tracing::info!(
            cert = name,
            dns_names = ?cert.dns_names(),
            not_after = %cert.not_after(),
            replaced,
            "Certificate installed"
        );
        Ok(true)
    }

    /// Remove a certificate. Returns whether it was present.
    pub fn del_certificate(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.certs.remove(name).is_none() {
            return false;
        }

        self.publish(&state);
        for updater in state.updaters.values() {
            updater.del_certificate(name);
        }

        tracing::info!(cert = name, "Certificate removed");
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Certificate>> {
        self.state.lock().certs.get(name).cloned()
    }

    /// Certificate names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().certs.keys().cloned().collect()
    }

    /// The current snapshot.
    pub fn certificates(&self) -> Arc<Vec<Arc<Certificate>>> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First certificate in the snapshot that can serve `hello`.
    ///
    /// Without SNI any certificate with a usable key qualifies. When several
    /// certificates cover the same name, which one wins is unspecified.
    pub fn find_certificate(&self, hello: &HelloInfo) -> Option<Arc<Certificate>> {
        self.snapshot
            .load()
            .iter()
            .find(|cert| {
                cert.supports(&hello.signature_schemes)
                    && hello
                        .server_name
                        .as_deref()
                        .map_or(true, |name| cert.matches_name(name))
            })
            .cloned()
    }

    /// [`find_certificate`](Self::find_certificate) with a diagnosable miss.
    pub fn get_tls_certificate(&self, hello: &HelloInfo) -> Result<Arc<Certificate>, CertError> {
        self.find_certificate(hello).ok_or_else(|| CertError::NoMatch {
            server_name: hello.server_name.clone(),
        })
    }

    /// Register an updater that hears about every certificate.
    pub fn add_updater(&self, name: &str, updater: Arc<dyn CertUpdater>) -> Result<(), CertError> {
        self.add_filtered_updater(name, UpdaterFilter::All, updater)
    }

    /// Register an updater for names starting with `prefix`.
    pub fn add_prefix_updater(
        &self,
        name: &str,
        prefix: impl Into<String>,
        updater: Arc<dyn CertUpdater>,
    ) -> Result<(), CertError> {
        self.add_filtered_updater(name, UpdaterFilter::Prefix(prefix.into()), updater)
    }

    /// Register an updater for an explicit set of names.
    pub fn add_names_updater(
        &self,
        name: &str,
        names: HashSet<String>,
        updater: Arc<dyn CertUpdater>,
    ) -> Result<(), CertError> {
        self.add_filtered_updater(name, UpdaterFilter::Names(names), updater)
    }

    /// Register an updater. Certificates already present are replayed to it
    /// before it sees any later change.
    pub fn add_filtered_updater(
        &self,
        name: &str,
        filter: UpdaterFilter,
        updater: Arc<dyn CertUpdater>,
    ) -> Result<(), CertError> {
        let mut state = self.state.lock();
        if state.updaters.contains_key(name) {
            return Err(CertError::DuplicateUpdater(name.to_string()));
        }

        let updater = FilteredUpdater {
            filter,
            inner: updater,
        };
        for (cert_name, cert) in &state.certs {
            updater.add_certificate(cert_name, cert.clone());
        }
        state.updaters.insert(name.to_string(), updater);
        tracing::debug!(updater = name, "Certificate updater registered");
        Ok(())
    }

    /// Unregister an updater. Returns whether it was present.
    pub fn del_updater(&self, name: &str) -> bool {
        self.state.lock().updaters.remove(name).is_some()
    }

    fn publish(&self, state: &State) {
        let snapshot: Vec<Arc<Certificate>> = state.certs.values().cloned().collect();
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CertManager")
            .field("certificates", &state.certs.keys().collect::<Vec<_>>())
            .field("updaters", &state.updaters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CertUpdater for CertManager {
    fn add_certificate(&self, name: &str, cert: Arc<Certificate>) {
        if let Err(e) = CertManager::add_certificate(self, name, cert) {
            tracing::warn!(cert = name, error = %e, "Rejected certificate update");
        }
    }

    fn del_certificate(&self, name: &str) {
        CertManager::del_certificate(self, name);
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hello = HelloInfo::from(&client_hello);
        match self.get_tls_certificate(&hello) {
            Ok(cert) => cert.certified_key().cloned(),
            Err(e) => {
                tracing::debug!(error = %e, "No certificate for handshake");
                None
            }
        }
    }
}
