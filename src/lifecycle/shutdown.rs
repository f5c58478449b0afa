//! Shutdown coordination.

use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Hotline;

/// How long handlers get to finish in-flight work.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A token cancelled after `grace`.
pub fn deadline(grace: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(grace) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

impl Hotline {
    /// Stop every entrypoint, then every certificate provider.
    ///
    /// Entrypoints get `grace` to drain; providers push their deletions
    /// before this returns.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = deadline(grace);
        self.entrypoints.shutdown_all(&deadline).await;
        let timed_out = deadline.is_cancelled();
        deadline.cancel();

        self.providers.cancel();
        join_all(self.provider_tasks).await;

        tracing::info!(
            timed_out,
            certificates = self.certificates.len(),
            "Shutdown complete"
        );
    }
}
