//! Background worker loops and their supervision.
//!
//! One embed worker and one classify worker run per process as tokio
//! tasks. Each loop is wrapped in a supervisor that restarts it after a
//! cooldown if it exits with an error or panics — workers recover from
//! transient failures locally, so a bubbled error is always unexpected.
//!
//! Shutdown is cooperative: flipping the `watch` channel stops new queue
//! pops, the in-flight item finishes, and [`WorkerHandle::shutdown`]
//! waits up to the drain deadline before abandoning the task. Work is
//! only committed at final writes, so an abandoned item simply reappears
//! unprocessed.

pub mod classify;
pub mod embed;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cooldown before a supervisor restarts a crashed worker.
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);

/// Exponential backoff delay for `attempt` (0-based): `base * 2^attempt`,
/// capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.min(20);
    let delay = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(cap_ms))
}

/// A running, supervised worker.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait up to `drain` for the in-flight item to
    /// complete; abandon the task after the deadline.
    pub async fn shutdown(self, drain: Duration) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(drain, self.handle).await {
            Ok(_) => info!(worker = self.name, "worker drained"),
            Err(_) => warn!(worker = self.name, "worker abandoned at drain deadline"),
        }
    }
}

/// Spawn a worker loop under supervision. `run` is restarted (after a
/// cooldown) until the shutdown flag flips.
pub fn spawn_supervised<F, Fut>(name: &'static str, run: F) -> WorkerHandle
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    let supervisor_rx = rx.clone();

    let handle = tokio::spawn(async move {
        loop {
            if *supervisor_rx.borrow() {
                return;
            }
            let worker = tokio::spawn(run(supervisor_rx.clone()));
            match worker.await {
                Ok(Ok(())) => {
                    info!(worker = name, "worker stopped");
                    return;
                }
                Ok(Err(e)) => {
                    error!(worker = name, error = %e, "worker failed, restarting after cooldown");
                }
                Err(join_err) => {
                    error!(worker = name, error = %join_err, "worker panicked, restarting after cooldown");
                }
            }
            if *supervisor_rx.borrow() {
                return;
            }
            tokio::time::sleep(RESTART_COOLDOWN).await;
        }
    });

    info!(worker = name, "worker started");
    WorkerHandle {
        name,
        shutdown: tx,
        handle,
    }
}

/// Sleep for `duration` or until shutdown flips, whichever comes first.
/// Returns `true` if shutdown was requested.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

/// Serialize a dead-letter entry carrying the failed item and the reason.
pub fn dead_letter_entry(item: &str, reason: &str) -> String {
    serde_json::json!({
        "item": item,
        "reason": reason,
        "at": crate::models::now_epoch(),
    })
    .to_string()
}
