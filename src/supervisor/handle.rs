//! Handle to a registered running service.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Opaque token identifying one registered unit of work (a syncer, the
/// scheduler, or any auxiliary long-running worker).
///
/// Stopping is a two-phase signal-then-wait: [`stop`](Self::stop) cancels
/// the service's token and then awaits its join handle, so the caller knows
/// the slot is free when the call returns. The second `stop` finds nothing
/// to join and returns immediately.
pub struct ServiceHandle {
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHandle {
    /// Spawns `f` with a fresh cancellation token and wraps the pair.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(f(cancel.clone()));
        Self {
            cancel,
            join: Mutex::new(Some(join)),
        }
    }

    /// Requests termination without waiting.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Requests termination and waits for the service to finish.
    /// Synchronous in effect, idempotent by construction.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if join.await.is_err() {
                error!("service panicked during stop");
            }
        }
    }
}
