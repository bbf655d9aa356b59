//! Where workers get their next job from.
//!
//! Two interchangeable sources: polling the job table directly, or consuming
//! the task queue. Exactly one is live per process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Error;
use crate::jobs::model::Job;
use crate::queue::{Task, TaskLease, TaskQueue};
use crate::store::{JobStore, Store};

/// One unit of work handed to a worker.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Poll source: the job is already claimed (`processing`).
    Claimed(Job),
    /// Queue source: a task lease; the job still has to be claimed.
    Task(TaskLease),
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Claimed(job) => job.id,
            Self::Task(lease) => lease.task.job_id,
        }
    }
}

/// Source of deliveries for the worker loop.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next delivery, or `None` when nothing arrived in this round. May wait.
    async fn next(&self) -> Result<Option<Delivery>, Error>;

    /// The delivery has been dealt with and must not come back.
    async fn ack(&self, delivery: &Delivery) -> Result<(), Error>;

    /// Make a requeued job deliverable again after `delay`.
    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), Error>;
}

/// Polls the job table with the guarded claim.
pub struct PollSource {
    store: Arc<dyn Store>,
    poll_interval: Duration,
}

impl PollSource {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }
}

#[async_trait]
impl JobSource for PollSource {
    async fn next(&self) -> Result<Option<Delivery>, Error> {
        match self.store.claim_next().await? {
            Some(job) => Ok(Some(Delivery::Claimed(job))),
            None => {
                tokio::time::sleep(self.poll_interval).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), Error> {
        Ok(())
    }

    /// Nothing to do: the job's `available_at` already gates the next claim.
    async fn schedule(&self, _job: &Job, _delay: Duration) -> Result<(), Error> {
        Ok(())
    }
}

/// Consumes the task queue.
pub struct QueueSource {
    queue: Arc<dyn TaskQueue>,
    wait: Duration,
}

impl QueueSource {
    /// `wait` bounds how long one `next` call blocks on an empty queue.
    pub fn new(queue: Arc<dyn TaskQueue>, wait: Duration) -> Self {
        Self { queue, wait }
    }
}

#[async_trait]
impl JobSource for QueueSource {
    async fn next(&self) -> Result<Option<Delivery>, Error> {
        Ok(self.queue.dequeue(self.wait).await?.map(Delivery::Task))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), Error> {
        if let Delivery::Task(lease) = delivery {
            self.queue.ack(lease).await?;
        }
        Ok(())
    }

    async fn schedule(&self, job: &Job, delay: Duration) -> Result<(), Error> {
        self.queue.enqueue(Task::for_job(job), delay).await?;
        Ok(())
    }
}
