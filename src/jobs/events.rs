//! Job change notifications — broadcast of job rows to interested subscribers.
//!
//! Delivery is best effort: slow subscribers may lag and miss events, and
//! nothing is buffered for clients that are not connected. Clients fall back
//! to polling the job store.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::model::Job;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A job row changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobUpdated { job: Job },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            Self::JobUpdated { job } => job,
        }
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEventFilter {
    pub client_id: Option<String>,
    pub conversation_id: Option<Uuid>,
}

impl JobEventFilter {
    pub fn matches(&self, event: &JobEvent) -> bool {
        let job = event.job();
        if let Some(ref client_id) = self.client_id
            && *client_id != job.client_id
        {
            return false;
        }
        if let Some(conversation_id) = self.conversation_id
            && conversation_id != job.conversation_id
        {
            return false;
        }
        true
    }
}

/// Fan-out of job changes.
#[derive(Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publish a job row. Ok if nobody is listening.
    pub fn publish(&self, job: &Job) {
        let _ = self.tx.send(JobEvent::JobUpdated { job: job.clone() });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new()
    }
}
