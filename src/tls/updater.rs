//! Certificate change observers.

use std::collections::HashSet;
use std::sync::Arc;

use crate::tls::Certificate;

/// Receives certificate additions and removals.
///
/// Called with the sender's write lock held: implementations must not call
/// back into the manager that notifies them.
pub trait CertUpdater: Send + Sync + 'static {
    fn add_certificate(&self, name: &str, cert: Arc<Certificate>);

    fn del_certificate(&self, name: &str);
}

/// Which certificate names an updater is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdaterFilter {
    #[default]
    All,
    Prefix(String),
    Names(HashSet<String>),
}

impl UpdaterFilter {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UpdaterFilter::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn accepts(&self, name: &str) -> bool {
        match self {
            UpdaterFilter::All => true,
            UpdaterFilter::Prefix(prefix) => name.starts_with(prefix.as_str()),
            UpdaterFilter::Names(names) => names.contains(name),
        }
    }
}

/// An updater that only hears about names its filter accepts.
#[derive(Clone)]
pub(crate) struct FilteredUpdater {
    pub filter: UpdaterFilter,
    pub inner: Arc<dyn CertUpdater>,
}

impl CertUpdater for FilteredUpdater {
    fn add_certificate(&self, name: &str, cert: Arc<Certificate>) {
        if self.filter.accepts(name) {
            self.inner.add_certificate(name, cert);
        }
    }

    fn del_certificate(&self, name: &str) {
        if self.filter.accepts(name) {
            self.inner.del_certificate(name);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records `+name` / `-name` for every call.
    #[derive(Default)]
    pub(crate) struct RecordingUpdater {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingUpdater {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl CertUpdater for RecordingUpdater {
        fn add_certificate(&self, name: &str, _cert: Arc<Certificate>) {
            self.events.lock().push(format!("+{name}"));
        }

        fn del_certificate(&self, name: &str) {
            self.events.lock().push(format!("-{name}"));
        }
    }

    #[test]
    fn filters() {
        assert!(UpdaterFilter::All.accepts("anything"));

        let prefix = UpdaterFilter::Prefix("web-".into());
        assert!(prefix.accepts("web-site"));
        assert!(!prefix.accepts("api-site"));

        let names = UpdaterFilter::names(["a", "b"]);
        assert!(names.accepts("a"));
        assert!(!names.accepts("ab"));
    }
}
