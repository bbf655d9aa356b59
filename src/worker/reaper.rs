//! Stale-job reaper — recovers jobs whose worker died mid-flight.
//!
//! A job left in `processing` longer than the job timeout plus a grace
//! period cannot still be running (the worker bounds every model call), so
//! it is treated as a failed attempt and goes through the retry policy.
//!
//! A job still `queued` well past its `available_at` has lost its task (the
//! enqueue failed after the row was written, or the queue dropped it) and is
//! handed to the job source again. Re-enqueueing is idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::{Dispatcher, Outcome};
use crate::error::{AgentError, Error};
use crate::store::JobStore;

/// Minimum time between sweeps.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Extra time past the job timeout before a claim counts as abandoned.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(60);

pub struct StaleJobReaper {
    dispatcher: Arc<Dispatcher>,
    stale_after: Duration,
    interval: Duration,
}

impl StaleJobReaper {
    pub fn new(dispatcher: Arc<Dispatcher>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            dispatcher,
            stale_after,
            interval: interval.max(MIN_REAP_INTERVAL),
        }
    }

    /// One sweep. Returns how many jobs were re-dispatched, requeued or failed.
    pub async fn reap_once(&self) -> Result<usize, Error> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        // Queued rows whose task never reached the queue, or was lost with it.
        let overdue = self.dispatcher.store().list_overdue_queued(cutoff).await?;
        let mut recovered = 0;
        for job in &overdue {
            self.dispatcher.source().schedule(job, Duration::ZERO).await?;
            recovered += 1;
        }
        if !overdue.is_empty() {
            debug!(count = overdue.len(), "Re-dispatched overdue queued jobs");
        }

        let stale = self.dispatcher.store().list_stale(cutoff).await?;
        if stale.is_empty() {
            return Ok(recovered);
        }

        info!(count = stale.len(), "Recovering stale processing jobs");
        let lost = AgentError::Unclassified(format!(
            "worker lost: no result within {}s",
            self.stale_after.as_secs()
        ));

        for job in stale {
            match self.dispatcher.resolve_failure(&job, &lost).await? {
                Outcome::Skipped => {}
                _ => recovered += 1,
            }
        }
        Ok(recovered)
    }

    /// Sweep every `interval` until shutdown.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                stale_after_secs = self.stale_after.as_secs(),
                "Stale-job reaper started"
            );
            let mut tick = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.reap_once().await {
                            warn!(error = %e, "Stale-job sweep failed");
                        }
                    }
                }
            }
            debug!("Stale-job reaper stopped");
        })
    }
}
