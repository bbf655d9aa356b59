//! Worker group — `max_jobs` worker loops sharing one dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, Outcome};
use super::reaper::StaleJobReaper;

/// Pause after a storage failure before the loop tries again.
pub const STORAGE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Handle to running workers.
///
/// Shutdown stops workers from taking new deliveries; a job already being
/// processed runs to its next state first.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let dispatcher = Arc::clone(&dispatcher);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, dispatcher, &mut rx).await;
            }));
        }

        info!(workers = n, "Worker group started");
        Self { shutdown_tx, joins }
    }

    /// Run the stale-job reaper alongside the workers, under the same
    /// shutdown signal.
    pub fn with_reaper(mut self, reaper: StaleJobReaper) -> Self {
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(reaper.spawn(rx));
        self
    }

    /// Ask every loop to stop after its current delivery.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all loops.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for result in futures::future::join_all(self.joins).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = dispatcher.source().next() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to fetch next job");
                backoff(shutdown_rx).await;
                continue;
            }
        };

        let job_id = delivery.job_id();
        match dispatcher.handle(delivery).await {
            Ok(Outcome::Skipped) => debug!(worker_id, job_id = %job_id, "Delivery skipped"),
            Ok(outcome) => debug!(worker_id, job_id = %job_id, ?outcome, "Delivery handled"),
            Err(e) => {
                error!(worker_id, job_id = %job_id, error = %e, "Job handling failed");
                if e.is_storage() {
                    backoff(shutdown_rx).await;
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}

/// Sleep for the storage backoff, waking early on shutdown.
async fn backoff(shutdown_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown_rx.changed() => {}
        _ = tokio::time::sleep(STORAGE_ERROR_BACKOFF) => {}
    }
}
