//! Polling certificate providers.
//!
//! # State Transitions (per tracked name)
//! ```text
//! tracked → polled each tick → changed → parsed → pushed (mark advanced)
//!                            → unchanged
//!                            → parse/fetch failure (logged, mark kept)
//! untracked → deletion pushed
//! provider cancelled → deletion pushed for every remaining name
//! ```
//!
//! # Design Decisions
//! - One loop per provider; sources are polled sequentially
//! - A failing source is retried every tick until fixed or untracked
//! - Deletions travel over a small channel so they are pushed before the
//!   next tick; overflow is parked and flushed on the next tick

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::handler::catch_panic;
use crate::tls::{CertError, CertUpdater, Certificate, PemBundle};

pub mod file;
pub mod url;

pub use file::{FileProvider, FileSource};
pub use self::url::{UrlProvider, UrlSource};

/// Default poll interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Shorter intervals are raised to this.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

const DELETE_BACKLOG: usize = 16;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid certificate URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: ::url::ParseError,
    },

    #[error("unsupported certificate URL scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),

    #[error("certificate source {0:?} is already tracked")]
    Duplicate(String),

    #[error(transparent)]
    Cert(#[from] CertError),
}

/// Result of one poll of a source.
#[derive(Debug)]
pub enum Polled<M> {
    /// Nothing new since the last mark.
    Unchanged,
    /// Something moved (a timestamp) but the content is the same.
    Touched(M),
    /// New content.
    Changed(PemBundle, M),
}

/// A place certificates are read from.
#[async_trait]
pub trait CertSource: Send + Sync + 'static {
    /// What the provider remembers between polls.
    type Mark: Clone + Send + Sync + 'static;

    /// Where the certificate comes from, for logs.
    fn describe(&self) -> String;

    async fn poll(&self, last: Option<&Self::Mark>) -> Result<Polled<Self::Mark>, ProviderError>;
}

struct Tracked<S: CertSource> {
    source: Arc<S>,
    mark: Option<S::Mark>,
    generation: u64,
}

struct Inner<S: CertSource> {
    tracked: HashMap<String, Tracked<S>>,
    parked_deletes: Vec<String>,
    next_generation: u64,
}

/// Polls a set of named sources and pushes what changed into an updater.
pub struct CertProvider<S: CertSource> {
    kind: &'static str,
    interval: Duration,
    updater: Arc<dyn CertUpdater>,
    inner: Mutex<Inner<S>>,
    delete_tx: mpsc::Sender<String>,
    delete_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl<S: CertSource> CertProvider<S> {
    pub fn new(kind: &'static str, updater: Arc<dyn CertUpdater>, interval: Duration) -> Self {
        let (delete_tx, delete_rx) = mpsc::channel(DELETE_BACKLOG);
        Self {
            kind,
            interval: interval.max(MIN_REFRESH_INTERVAL),
            updater,
            inner: Mutex::new(Inner {
                tracked: HashMap::new(),
                parked_deletes: Vec::new(),
                next_generation: 0,
            }),
            delete_tx,
            delete_rx: Mutex::new(Some(delete_rx)),
        }
    }

    /// Start polling `source` under `name`; picked up on the next tick.
    pub fn track(&self, name: impl Into<String>, source: S) -> Result<(), ProviderError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.tracked.contains_key(&name) {
            return Err(ProviderError::Duplicate(name));
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        tracing::debug!(provider = self.kind, cert = %name, source = %source.describe(), "Tracking certificate source");
        inner.tracked.insert(
            name,
            Tracked {
                source: Arc::new(source),
                mark: None,
                generation,
            },
        );
        Ok(())
    }

    /// Stop polling `name` and have its certificate deleted downstream.
    /// Returns whether it was tracked.
    pub fn untrack(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.tracked.remove(name).is_none() {
            return false;
        }
        if self.delete_tx.try_send(name.to_string()).is_err() {
            tracing::debug!(provider = self.kind, cert = name, "Delete queue full, deferring to next tick");
            inner.parked_deletes.push(name.to_string());
        }
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().tracked.keys().cloned().collect();
        names.sort();
        names
    }

    /// Poll every tracked source once.
    pub async fn refresh(&self) {
        let (due, parked) = {
            let mut inner = self.inner.lock();
            let due: Vec<(String, Arc<S>, Option<S::Mark>, u64)> = inner
                .tracked
                .iter()
                .map(|(name, t)| (name.clone(), t.source.clone(), t.mark.clone(), t.generation))
                .collect();
            (due, std::mem::take(&mut inner.parked_deletes))
        };

        for name in parked {
            self.updater.del_certificate(&name);
        }

        for (name, source, mark, generation) in due {
            self.refresh_one(&name, &source, mark.as_ref(), generation)
                .await;
        }
    }

    async fn refresh_one(&self, name: &str, source: &S, mark: Option<&S::Mark>, generation: u64) {
        let (pem, next_mark) = match source.poll(mark).await {
            Ok(Polled::Unchanged) => return,
            Ok(Polled::Touched(next_mark)) => {
                self.advance(name, generation, next_mark);
                return;
            }
            Ok(Polled::Changed(pem, next_mark)) => (pem, next_mark),
            Err(e) => {
                tracing::warn!(provider = self.kind, cert = name, source = %source.describe(), error = %e, "Certificate source poll failed");
                return;
            }
        };

        let cert = match Certificate::from_pem(pem) {
            Ok(cert) => Arc::new(cert),
            Err(e) => {
                tracing::error!(provider = self.kind, cert = name, source = %source.describe(), error = %e, "Invalid certificate, keeping previous one");
                return;
            }
        };

        // untracked while we were polling
        if !self.advance(name, generation, next_mark) {
            return;
        }
        self.updater.add_certificate(name, cert);
    }

    fn advance(&self, name: &str, generation: u64, mark: S::Mark) -> bool {
        let mut inner = self.inner.lock();
        match inner.tracked.get_mut(name) {
            Some(t) if t.generation == generation => {
                t.mark = Some(mark);
                true
            }
            _ => false,
        }
    }

    /// Poll on every interval until `token` is cancelled, then delete every
    /// certificate still tracked. Runs at most once per provider.
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut delete_rx) = self.delete_rx.lock().take() else {
            tracing::warn!(provider = self.kind, "Certificate provider already running");
            return;
        };

        tracing::info!(provider = self.kind, interval_secs = self.interval.as_secs(), "Certificate provider starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(name) = delete_rx.recv() => {
                    self.updater.del_certificate(&name);
                }
                _ = ticker.tick() => {
                    catch_panic("cert_provider_tick", self.refresh()).await;
                }
            }
        }

        while let Ok(name) = delete_rx.try_recv() {
            self.updater.del_certificate(&name);
        }
        let remaining: Vec<String> = {
            let mut inner = self.inner.lock();
            let mut names: Vec<String> = inner.tracked.drain().map(|(name, _)| name).collect();
            names.append(&mut inner.parked_deletes);
            names
        };
        for name in &remaining {
            self.updater.del_certificate(name);
        }
        tracing::info!(provider = self.kind, deleted = remaining.len(), "Certificate provider stopped");
    }
}

impl<S: CertSource> std::fmt::Debug for CertProvider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertProvider")
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("tracked", &self.names())
            .finish()
    }
}
