//! Hot-swappable handler slot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::handler::{Handler, SharedHandler};
use crate::net::Conn;
use crate::server::ServerError;

/// `ArcSwap` needs a sized payload; this box gives the trait object one.
struct Slot(SharedHandler);

/// A single-slot, atomically replaceable handler.
///
/// Reads never block: every call goes through one `arc-swap` load. A
/// connection already handed to the previous handler stays with it; the
/// swap only affects calls that start afterwards.
pub struct SwitchableHandler {
    slot: ArcSwap<Slot>,
}

impl SwitchableHandler {
    pub fn new(initial: SharedHandler) -> Self {
        Self {
            slot: ArcSwap::from_pointee(Slot(initial)),
        }
    }

    /// The current handler.
    pub fn get(&self) -> SharedHandler {
        self.slot.load().0.clone()
    }

    /// Replace the handler and return the previous one.
    pub fn swap(&self, handler: SharedHandler) -> SharedHandler {
        self.slot.swap(Arc::new(Slot(handler))).0.clone()
    }

    /// Replace the handler.
    pub fn set(&self, handler: SharedHandler) {
        self.slot.store(Arc::new(Slot(handler)));
    }
}

impl std::fmt::Debug for SwitchableHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchableHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for SwitchableHandler {
    async fn on_connection(&self, conn: Conn) {
        self.get().on_connection(conn).await
    }

    async fn on_server_exit(&self, err: &ServerError) {
        self.get().on_server_exit(err).await
    }

    async fn on_shutdown(&self, token: &CancellationToken) {
        self.get().on_shutdown(token).await
    }
}
