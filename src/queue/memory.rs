//! In-memory task queue for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{Task, TaskLease, TaskQueue};
use crate::error::QueueError;

struct Entry {
    task: Task,
    visible_at: Instant,
    lease: Option<Uuid>,
    deliveries: u32,
    seq: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
}

/// Queue state lives in a map keyed by job id; delivery order is by
/// visibility time, then insertion order.
pub struct InMemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Try to lease one visible task. Otherwise report when the next one
    /// becomes visible.
    async fn try_lease(&self) -> Result<TaskLease, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let next = state
            .entries
            .values_mut()
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| (e.visible_at, e.seq));

        if let Some(entry) = next {
            let token = Uuid::new_v4();
            entry.lease = Some(token);
            entry.visible_at = now + self.visibility_timeout;
            entry.deliveries += 1;
            return Ok(TaskLease {
                task: entry.task.clone(),
                token,
                deliveries: entry.deliveries,
            });
        }

        Err(state.entries.values().map(|e| e.visible_at).min())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        let visible_at = Instant::now() + delay;
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;

        match state.entries.get_mut(&task.job_id) {
            Some(entry) if entry.lease.is_some() => {
                debug!(job_id = %task.job_id, "Re-arming leased task");
                entry.lease = None;
                entry.visible_at = visible_at;
                entry.seq = seq;
                entry.task = task;
            }
            Some(_) => {
                debug!(job_id = %task.job_id, "Task already waiting");
                return Ok(());
            }
            None => {
                state.entries.insert(
                    task.job_id,
                    Entry {
                        task,
                        visible_at,
                        lease: None,
                        deliveries: 0,
                        seq,
                    },
                );
            }
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<TaskLease>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let next_visible = match self.try_lease().await {
                Ok(lease) => return Ok(Some(lease)),
                Err(next_visible) => next_visible,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_visible.map_or(deadline, |t| t.min(deadline)).max(now);

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, lease: &TaskLease) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let job_id = lease.task.job_id;
        let current = state.entries.get(&job_id).and_then(|e| e.lease);
        if current == Some(lease.token) {
            state.entries.remove(&job_id);
            Ok(true)
        } else {
            debug!(job_id = %job_id, "Ack ignored, lease no longer current");
            Ok(false)
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.entries.len())
    }
}
