//! Supervised task spawning
//!
//! Every background worker runs under a supervisor that logs unexpected
//! faults and restarts the worker up to a budget. When the budget is
//! spent, the failure callback runs so the owning component can fail the
//! associated work cleanly. No background worker dies silently.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Spawn `factory`'s future under supervision
///
/// The worker finishing normally ends supervision. A panic is logged and
/// the worker restarted after a short delay, at most `restart_limit`
/// times; exceeding the budget invokes `on_fail` with a description.
pub fn spawn_supervised<F, Fut, C>(name: &str, mut factory: F, restart_limit: u32, on_fail: C) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    C: FnOnce(String) + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let mut restarts = 0u32;
        loop {
            let worker: JoinHandle<()> = tokio::spawn(factory());
            match worker.await {
                Ok(()) => return,
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    restarts += 1;
                    if restarts > restart_limit {
                        let message = format!("worker {name} failed {restarts} times, giving up: {e}");
                        error!("{message}");
                        on_fail(message);
                        return;
                    }
                    warn!(worker = %name, restarts, error = %e, "worker panicked, restarting");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(restarts))).await;
                }
            }
        }
    })
}
