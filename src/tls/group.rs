//! Certificates partitioned by group.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::tls::{CertError, CertManager, CertUpdater, Certificate};

/// A certificate address: which group, which name inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertKey {
    pub group: String,
    pub name: String,
}

impl CertKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// One [`CertManager`] per group, created on first use.
#[derive(Debug, Default)]
pub struct CertManagerGroup {
    managers: DashMap<String, Arc<CertManager>>,
}

impl CertManagerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager of `group`, created if missing.
    pub fn manager(&self, group: &str) -> Arc<CertManager> {
        self.managers
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(CertManager::new()))
            .clone()
    }

    pub fn get(&self, group: &str) -> Option<Arc<CertManager>> {
        self.managers.get(group).map(|m| m.value().clone())
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.managers.iter().map(|m| m.key().clone()).collect();
        groups.sort();
        groups
    }

    pub fn add_certificate(
        &self,
        key: &CertKey,
        cert: impl Into<Arc<Certificate>>,
    ) -> Result<bool, CertError> {
        self.manager(&key.group).add_certificate(&key.name, cert)
    }

    /// Remove a certificate; a missing group is the same as a missing name.
    pub fn del_certificate(&self, key: &CertKey) -> bool {
        self.get(&key.group)
            .is_some_and(|manager| manager.del_certificate(&key.name))
    }

    pub fn find(&self, key: &CertKey) -> Option<Arc<Certificate>> {
        self.get(&key.group)?.get(&key.name)
    }

    /// An updater that writes into `group`.
    pub fn updater(self: &Arc<Self>, group: impl Into<String>) -> GroupUpdater {
        GroupUpdater {
            group: group.into(),
            managers: self.clone(),
        }
    }
}

/// Routes updates for bare names into one group of a [`CertManagerGroup`].
#[derive(Debug, Clone)]
pub struct GroupUpdater {
    group: String,
    managers: Arc<CertManagerGroup>,
}

impl GroupUpdater {
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl CertUpdater for GroupUpdater {
    fn add_certificate(&self, name: &str, cert: Arc<Certificate>) {
        let key = CertKey::new(self.group.clone(), name);
        if let Err(e) = self.managers.add_certificate(&key, cert) {
            tracing::warn!(cert = %key, error = %e, "Rejected certificate update");
        }
    }

    fn del_certificate(&self, name: &str) {
        self.managers
            .del_certificate(&CertKey::new(self.group.clone(), name));
    }
}
