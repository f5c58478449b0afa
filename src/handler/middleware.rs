//! Priority-ordered middleware chains.
//!
//! A [`Middleware`] wraps a handler into another handler. The
//! [`MiddlewareManager`] keeps a named set of them around a terminal handler
//! and republishes the composed chain after every mutation:
//!
//! ```text
//! sorted ascending by (priority, insertion)
//! composed = mw[0](mw[1](... mw[n-1](terminal) ...))
//! ```
//!
//! Mutations are serialized by a mutex; readers load the published chain
//! without locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::handler::{Handler, SharedHandler, SwitchableHandler};
use crate::net::Conn;
use crate::server::ServerError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MiddlewareError {
    #[error("middleware name must not be empty")]
    EmptyName,

    #[error("middleware {0:?} is already registered")]
    Duplicate(String),
}

type WrapFn = dyn Fn(SharedHandler) -> SharedHandler + Send + Sync;

/// A named handler decorator.
///
/// Lower priorities sit further out: priority 1 sees a connection before
/// priority 2 does.
#[derive(Clone)]
pub struct Middleware {
    name: String,
    priority: i32,
    wrap: Arc<WrapFn>,
}

impl Middleware {
    pub fn new<F>(name: impl Into<String>, priority: i32, wrap: F) -> Self
    where
        F: Fn(SharedHandler) -> SharedHandler + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            wrap: Arc::new(wrap),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Wrap `next` in this middleware.
    pub fn apply(&self, next: SharedHandler) -> SharedHandler {
        (self.wrap)(next)
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Build a middleware from an async function of the connection and the
/// next handler. Server exit and shutdown pass straight through to `next`.
pub fn from_fn<F, Fut>(name: impl Into<String>, priority: i32, f: F) -> Middleware
where
    F: Fn(Conn, SharedHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    Middleware::new(name, priority, move |next| {
        Arc::new(FnMiddleware {
            f: f.clone(),
            next,
        }) as SharedHandler
    })
}

struct FnMiddleware<F> {
    f: Arc<F>,
    next: SharedHandler,
}

#[async_trait]
impl<F, Fut> Handler for FnMiddleware<F>
where
    F: Fn(Conn, SharedHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_connection(&self, conn: Conn) {
        (self.f)(conn, self.next.clone()).await
    }

    async fn on_server_exit(&self, err: &ServerError) {
        self.next.on_server_exit(err).await
    }

    async fn on_shutdown(&self, token: &CancellationToken) {
        self.next.on_shutdown(token).await
    }
}

struct Entry {
    seq: u64,
    middleware: Middleware,
}

struct State {
    terminal: SharedHandler,
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, middleware: Middleware) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(middleware.name.clone(), Entry { seq, middleware });
    }

    fn sorted(&self) -> Vec<&Middleware> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.middleware.priority, e.seq));
        entries.into_iter().map(|e| &e.middleware).collect()
    }

    fn compose(&self) -> SharedHandler {
        self.sorted()
            .into_iter()
            .rev()
            .fold(self.terminal.clone(), |next, mw| mw.apply(next))
    }
}

/// A named middleware set around a swappable terminal handler.
pub struct MiddlewareManager {
    state: Mutex<State>,
    composed: SwitchableHandler,
}

impl MiddlewareManager {
    pub fn new(terminal: SharedHandler) -> Self {
        Self {
            composed: SwitchableHandler::new(terminal.clone()),
            state: Mutex::new(State {
                terminal,
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// The composed chain. Lock-free.
    pub fn handler(&self) -> SharedHandler {
        self.composed.get()
    }

    /// Add one middleware. Fails without changes if the name is taken.
    pub fn add(&self, middleware: Middleware) -> Result<(), MiddlewareError> {
        self.use_middlewares([middleware])
    }

    /// Add several middleware with one recomposition.
    ///
    /// All-or-nothing: any empty or taken name (including a repeat within
    /// `middlewares`) leaves the set untouched.
    pub fn use_middlewares(
        &self,
        middlewares: impl IntoIterator<Item = Middleware>,
    ) -> Result<(), MiddlewareError> {
        let middlewares: Vec<Middleware> = middlewares.into_iter().collect();
        let mut state = self.state.lock();
        check_names(&middlewares, |name| state.entries.contains_key(name))?;
        for middleware in middlewares {
            tracing::debug!(middleware = %middleware.name, priority = middleware.priority, "Middleware added");
            state.insert(middleware);
        }
        self.publish(&state);
        Ok(())
    }

    /// Remove a middleware by name. Returns whether it was present.
    pub fn del(&self, name: &str) -> bool {
        self.cancel([name]) > 0
    }

    /// Remove several middleware by name; absent names are ignored.
    /// Returns how many were removed.
    pub fn cancel<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> usize {
        let mut state = self.state.lock();
        let removed = names
            .into_iter()
            .filter(|name| state.entries.remove(*name).is_some())
            .inspect(|name| tracing::debug!(middleware = %name, "Middleware removed"))
            .count();
        if removed > 0 {
            self.publish(&state);
        }
        removed
    }

    /// Replace the whole set with one recomposition.
    pub fn reset(
        &self,
        middlewares: impl IntoIterator<Item = Middleware>,
    ) -> Result<(), MiddlewareError> {
        let middlewares: Vec<Middleware> = middlewares.into_iter().collect();
        check_names(&middlewares, |_| false)?;

        let mut state = self.state.lock();
        state.entries.clear();
        for middleware in middlewares {
            state.insert(middleware);
        }
        tracing::debug!(count = state.entries.len(), "Middleware set replaced");
        self.publish(&state);
        Ok(())
    }

    /// Replace the terminal handler.
    pub fn set_handler(&self, terminal: SharedHandler) {
        self.swap_handler(terminal);
    }

    /// Replace the terminal handler and return the previous one.
    pub fn swap_handler(&self, terminal: SharedHandler) -> SharedHandler {
        let mut state = self.state.lock();
        let old = std::mem::replace(&mut state.terminal, terminal);
        self.publish(&state);
        old
    }

    /// Middleware names in composition order, outermost first.
    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock();
        state.sorted().into_iter().map(|m| m.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, state: &State) {
        self.composed.set(state.compose());
    }
}

fn check_names(
    middlewares: &[Middleware],
    taken: impl Fn(&str) -> bool,
) -> Result<(), MiddlewareError> {
    let mut seen = std::collections::HashSet::new();
    for middleware in middlewares {
        if middleware.name.is_empty() {
            return Err(MiddlewareError::EmptyName);
        }
        if taken(&middleware.name) || !seen.insert(middleware.name.as_str()) {
            return Err(MiddlewareError::Duplicate(middleware.name.clone()));
        }
    }
    Ok(())
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("middlewares", &self.names())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for MiddlewareManager {
    async fn on_connection(&self, conn: Conn) {
        self.handler().on_connection(conn).await
    }

    async fn on_server_exit(&self, err: &ServerError) {
        self.handler().on_server_exit(err).await
    }

    async fn on_shutdown(&self, token: &CancellationToken) {
        self.handler().on_shutdown(token).await
    }
}
