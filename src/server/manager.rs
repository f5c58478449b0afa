//! Registry of running entrypoints.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::server::{EntryPoint, EntryPointError};

/// Entrypoints by name.
#[derive(Debug, Default)]
pub struct EntryPointManager {
    entrypoints: DashMap<String, Arc<EntryPoint>>,
}

impl EntryPointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entrypoint. Fails if its name is taken.
    pub fn add(&self, entrypoint: EntryPoint) -> Result<Arc<EntryPoint>, EntryPointError> {
        match self.entrypoints.entry(entrypoint.name().to_string()) {
            Entry::Occupied(entry) => Err(EntryPointError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                let entrypoint = Arc::new(entrypoint);
                entry.insert(entrypoint.clone());
                Ok(entrypoint)
            }
        }
    }

    /// Unregister an entrypoint. The caller decides whether to stop it.
    pub fn remove(&self, name: &str) -> Option<Arc<EntryPoint>> {
        self.entrypoints.remove(name).map(|(_, ep)| ep)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntryPoint>> {
        self.entrypoints.get(name).map(|ep| ep.value().clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entrypoints.iter().map(|ep| ep.key().clone()).collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<Arc<EntryPoint>> {
        let mut all: Vec<Arc<EntryPoint>> =
            self.entrypoints.iter().map(|ep| ep.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.entrypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entrypoints.is_empty()
    }

    /// Start every registered entrypoint on a background task.
    pub fn spawn_all(&self) -> Result<(), EntryPointError> {
        for ep in self.list() {
            ep.spawn()?;
        }
        Ok(())
    }

    /// Unregister and shut down every entrypoint concurrently.
    pub async fn shutdown_all(&self, token: &CancellationToken) {
        let all: Vec<Arc<EntryPoint>> = self
            .names()
            .iter()
            .filter_map(|name| self.remove(name))
            .collect();

        tracing::info!(count = all.len(), "Shutting down entrypoints");
        join_all(all.iter().map(|ep| ep.shutdown(token))).await;
    }
}
