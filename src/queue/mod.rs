//! Task queue — at-least-once delivery of job ids to workers.
//!
//! The queue never holds authoritative job state; it only says "look at this
//! job". Workers re-read the job row before doing anything.

pub mod libsql_queue;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::model::Job;

pub use libsql_queue::LibSqlTaskQueue;
pub use memory::InMemoryTaskQueue;

/// A unit of work: process job `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub job_id: Uuid,
    pub conversation_id: Uuid,
    /// Snapshot of the job request at enqueue time.
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            conversation_id: job.conversation_id,
            payload: serde_json::to_value(&job.request).unwrap_or(serde_json::Value::Null),
            enqueued_at: Utc::now(),
        }
    }
}

/// A delivered task. Only the holder of the current lease token can ack it.
#[derive(Debug, Clone)]
pub struct TaskLease {
    pub task: Task,
    pub token: Uuid,
    /// How many times this task has been handed out, this delivery included.
    pub deliveries: u32,
}

/// Work queue keyed by job id.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make `task` deliverable after `delay`.
    ///
    /// Idempotent on `task.job_id`: a waiting task is left untouched, a
    /// leased one is re-armed so the current holder's `ack` no longer
    /// removes it.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError>;

    /// Take the next visible task, waiting up to `wait` for one to appear.
    /// The task becomes invisible for the visibility timeout and is handed
    /// out again if not acked by then.
    async fn dequeue(&self, wait: Duration) -> Result<Option<TaskLease>, QueueError>;

    /// Remove the task if `lease` is still its current lease. Returns whether
    /// anything was removed.
    async fn ack(&self, lease: &TaskLease) -> Result<bool, QueueError>;

    /// Number of tasks held, leased or not.
    async fn len(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}
