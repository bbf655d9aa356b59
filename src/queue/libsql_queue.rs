//! Durable task queue in a libSQL table (`job_tasks`).
//!
//! Several processes may share one file; a lease is taken with a guarded
//! UPDATE so only one consumer wins each delivery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Task, TaskLease, TaskQueue};
use crate::error::QueueError;
use crate::store::libsql_backend::{configure_file_connection, fmt_datetime, parse_datetime};
use crate::store::migrations;

/// How often an empty `dequeue` re-checks the table.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Visible candidates tried per lease attempt.
const LEASE_CANDIDATES: i64 = 8;

pub struct LibSqlTaskQueue {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl LibSqlTaskQueue {
    /// Open (or create) the queue table in a local database file.
    pub async fn new_local(path: &Path, visibility_timeout: Duration) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::Unavailable(format!("Failed to create queue directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("Failed to open queue database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Unavailable(format!("Failed to create connection: {e}")))?;
        configure_file_connection(&conn).await;

        let queue = Self::from_parts(db, conn, visibility_timeout).await?;
        info!(path = %path.display(), "Task queue opened");
        Ok(queue)
    }

    /// Create an in-memory queue (for tests).
    pub async fn new_memory(visibility_timeout: Duration) -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("Failed to create queue database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Unavailable(format!("Failed to create connection: {e}")))?;
        Self::from_parts(db, conn, visibility_timeout).await
    }

    async fn from_parts(
        db: LibSqlDatabase,
        conn: Connection,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        migrations::run_migrations(&conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override how often an empty `dequeue` re-checks the table.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_lease(&self) -> Result<Option<TaskLease>, QueueError> {
        let now = Utc::now();
        let now_str = fmt_datetime(now);
        let mut rows = self
            .conn
            .query(
                "SELECT job_id FROM job_tasks WHERE visible_at <= ?1
                 ORDER BY visible_at ASC, seq ASC LIMIT ?2",
                params![now_str.clone(), LEASE_CANDIDATES],
            )
            .await
            .map_err(|e| QueueError::OperationFailed(format!("dequeue: {e}")))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(job_id) = row.get::<String>(0) {
                candidates.push(job_id);
            }
        }

        let invisible_until = fmt_datetime(now + chrono_duration(self.visibility_timeout));
        for job_id in candidates {
            let token = Uuid::new_v4();
            let changed = self
                .conn
                .execute(
                    "UPDATE job_tasks SET lease_token = ?2, visible_at = ?3,
                        deliveries = deliveries + 1
                     WHERE job_id = ?1 AND visible_at <= ?4",
                    params![
                        job_id.clone(),
                        token.to_string(),
                        invisible_until.clone(),
                        now_str.clone()
                    ],
                )
                .await
                .map_err(|e| QueueError::OperationFailed(format!("dequeue lease: {e}")))?;

            if changed == 0 {
                debug!(job_id = %job_id, "Lost lease race");
                continue;
            }
            return self.load_lease(&job_id, token).await;
        }
        Ok(None)
    }

    async fn load_lease(&self, job_id: &str, token: Uuid) -> Result<Option<TaskLease>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_id, conversation_id, payload, enqueued_at, deliveries
                 FROM job_tasks WHERE job_id = ?1 AND lease_token = ?2",
                params![job_id.to_string(), token.to_string()],
            )
            .await
            .map_err(|e| QueueError::OperationFailed(format!("load_lease: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(QueueError::OperationFailed(format!("load_lease: {e}"))),
        };

        let job_id: String = row
            .get(0)
            .map_err(|e| QueueError::Payload(format!("job_id: {e}")))?;
        let conversation_id: String = row
            .get(1)
            .map_err(|e| QueueError::Payload(format!("conversation_id: {e}")))?;
        let payload: String = row.get(2).unwrap_or_else(|_| "null".to_string());
        let enqueued_at: String = row.get(3).unwrap_or_default();
        let deliveries: i64 = row.get(4).unwrap_or(1);

        let task = Task {
            job_id: Uuid::parse_str(&job_id).map_err(|e| QueueError::Payload(e.to_string()))?,
            conversation_id: Uuid::parse_str(&conversation_id)
                .map_err(|e| QueueError::Payload(e.to_string()))?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| QueueError::Payload(e.to_string()))?,
            enqueued_at: parse_datetime(&enqueued_at),
        };
        Ok(Some(TaskLease {
            task,
            token,
            deliveries: deliveries.max(0) as u32,
        }))
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl TaskQueue for LibSqlTaskQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        let visible_at = fmt_datetime(Utc::now() + chrono_duration(delay));
        let payload =
            serde_json::to_string(&task.payload).map_err(|e| QueueError::Payload(e.to_string()))?;

        // Waiting tasks are left alone; leased ones are re-armed.
        self.conn
            .execute(
                "INSERT INTO job_tasks
                    (job_id, conversation_id, payload, enqueued_at, visible_at, lease_token, deliveries, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_tasks))
                 ON CONFLICT (job_id) DO UPDATE SET
                    lease_token = NULL,
                    visible_at = excluded.visible_at,
                    payload = excluded.payload,
                    seq = excluded.seq
                 WHERE job_tasks.lease_token IS NOT NULL",
                params![
                    task.job_id.to_string(),
                    task.conversation_id.to_string(),
                    payload,
                    fmt_datetime(task.enqueued_at),
                    visible_at,
                ],
            )
            .await
            .map_err(|e| QueueError::OperationFailed(format!("enqueue: {e}")))?;

        debug!(job_id = %task.job_id, delay_ms = delay.as_millis() as u64, "Task enqueued");
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<TaskLease>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_lease().await? {
                return Ok(Some(lease));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease: &TaskLease) -> Result<bool, QueueError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM job_tasks WHERE job_id = ?1 AND lease_token = ?2",
                params![lease.task.job_id.to_string(), lease.token.to_string()],
            )
            .await
            .map_err(|e| QueueError::OperationFailed(format!("ack: {e}")))?;

        if changed == 0 {
            debug!(job_id = %lease.task.job_id, "Ack ignored, lease no longer current");
        }
        Ok(changed > 0)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM job_tasks", ())
            .await
            .map_err(|e| QueueError::OperationFailed(format!("len: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(QueueError::OperationFailed(format!("len: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task {
            job_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            payload: serde_json::json!({"user_text": "q", "model_name": "m"}),
            enqueued_at: Utc::now(),
        }
    }

    async fn queue(visibility: Duration) -> LibSqlTaskQueue {
        LibSqlTaskQueue::new_memory(visibility)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack() {
        let q = queue(Duration::from_secs(30)).await;
        let t = task();
        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);

        let lease = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task.job_id, t.job_id);
        assert_eq!(lease.task.payload, t.payload);
        assert_eq!(lease.deliveries, 1);

        assert!(q.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert!(q.ack(&lease).await.unwrap());
        assert!(q.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_enqueue_keeps_one_task() {
        let q = queue(Duration::from_secs(30)).await;
        let t = task();
        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let q = queue(Duration::from_millis(50)).await;
        let t = task();
        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();

        let first = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = q.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(second.task.job_id, t.job_id);
        assert_eq!(second.deliveries, 2);

        assert!(!q.ack(&first).await.unwrap());
        assert!(q.ack(&second).await.unwrap());
    }

    #[tokio::test]
    async fn reenqueue_while_leased_rearms() {
        let q = queue(Duration::from_secs(30)).await;
        let t = task();
        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        let lease = q.dequeue(Duration::ZERO).await.unwrap().unwrap();

        q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        assert!(!q.ack(&lease).await.unwrap());
        assert_eq!(q.len().await.unwrap(), 1);

        let again = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.task.job_id, t.job_id);
    }

    #[tokio::test]
    async fn delayed_task_not_visible_yet() {
        let q = queue(Duration::from_secs(30)).await;
        q.enqueue(task(), Duration::from_secs(60)).await.unwrap();
        assert!(
            q.dequeue(Duration::from_millis(30))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tasks_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");
        let t = task();
        {
            let q = LibSqlTaskQueue::new_local(&path, Duration::from_secs(30))
                .await
                .unwrap();
            q.enqueue(t.clone(), Duration::ZERO).await.unwrap();
        }
        let q = LibSqlTaskQueue::new_local(&path, Duration::from_secs(30))
            .await
            .unwrap();
        let lease = q.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lease.task.job_id, t.job_id);
    }
}
