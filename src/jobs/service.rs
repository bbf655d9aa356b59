//! Job service — the operations exposed to API callers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error, JobError};
use crate::jobs::model::{Job, JobFilter, JobRequest, NewJob, StatusUpdate};
use crate::queue::{Task, TaskQueue};
use crate::store::{ConversationStore, JobStore, MessageRole, MessageStore, NewMessage, Store};

/// Result of a submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Submission {
    pub user_message_id: Uuid,
    pub job: Job,
}

/// Creates jobs and hands them to the workers.
pub struct JobService {
    store: Arc<dyn Store>,
    /// `None` when workers poll the job table instead of the queue.
    queue: Option<Arc<dyn TaskQueue>>,
    max_retries: u32,
}

impl JobService {
    pub fn new(store: Arc<dyn Store>, queue: Option<Arc<dyn TaskQueue>>, max_retries: u32) -> Self {
        Self {
            store,
            queue,
            max_retries,
        }
    }

    /// Record the user's question and queue a job to answer it.
    pub async fn submit(
        &self,
        conversation_id: Uuid,
        client_id: &str,
        request: JobRequest,
    ) -> Result<Submission, Error> {
        request.validate().map_err(JobError::InvalidRequest)?;

        let user_text = request.user_text.clone();
        let job = self
            .store
            .create_job(
                &NewJob::new(conversation_id, client_id, request).with_max_retries(self.max_retries),
            )
            .await?;

        let user_message_id = match self
            .store
            .add_message(&NewMessage {
                id: Uuid::new_v4(),
                conversation_id,
                role: MessageRole::User,
                content: user_text,
                meta: serde_json::json!({ "job_id": job.id }),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.abandon(&job, &e).await;
                return Err(e.into());
            }
        };

        self.dispatch_or_defer(&job).await;
        self.store.touch_conversation(conversation_id).await?;

        info!(
            job_id = %job.id,
            conversation_id = %conversation_id,
            client_id,
            "Job submitted"
        );
        Ok(Submission {
            user_message_id,
            job,
        })
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, Error> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, Error> {
        Ok(self.store.list_jobs(filter).await?)
    }

    /// Operator retry of a failed job. The retry count is kept.
    pub async fn retry(&self, id: Uuid) -> Result<Job, Error> {
        match self.store.reset_failed(id).await? {
            Some(job) => {
                self.dispatch_or_defer(&job).await;
                info!(job_id = %id, retry_count = job.retry_count, "Failed job requeued by operator");
                Ok(job)
            }
            None => {
                let job = self.get_job(id).await?;
                Err(JobError::NotRetryable {
                    id,
                    status: job.status.to_string(),
                }
                .into())
            }
        }
    }

    /// Hand `job` to the queue. The row is already durable, so a queue
    /// failure is not reported to the caller: the stale-job reaper
    /// re-dispatches queued jobs that stay undelivered.
    async fn dispatch_or_defer(&self, job: &Job) {
        let Some(ref queue) = self.queue else {
            return;
        };
        if let Err(e) = queue.enqueue(Task::for_job(job), Duration::ZERO).await {
            warn!(
                job_id = %job.id,
                error = %e,
                "Enqueue failed, job left for re-dispatch"
            );
        }
    }

    /// Fail a job whose submission could not be completed so it is never
    /// answered without its question.
    async fn abandon(&self, job: &Job, cause: &DatabaseError) {
        let update = StatusUpdate::fail(format!("submission incomplete: {cause}"));
        if let Err(e) = self.store.update_status(job.id, &update).await {
            error!(job_id = %job.id, error = %e, "Could not fail incomplete submission");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::jobs::model::JobStatus;
    use crate::queue::{InMemoryTaskQueue, TaskLease};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;

    /// Queue whose broker is unreachable.
    struct DownQueue;

    #[async_trait]
    impl TaskQueue for DownQueue {
        async fn enqueue(&self, _task: Task, _delay: Duration) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }

        async fn dequeue(&self, _wait: Duration) -> Result<Option<TaskLease>, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }

        async fn ack(&self, _lease: &TaskLease) -> Result<bool, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }

        async fn len(&self) -> Result<usize, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
    }

    async fn service() -> (JobService, Arc<LibSqlBackend>, Arc<InMemoryTaskQueue>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30)));
        let svc = JobService::new(store.clone(), Some(queue.clone()), 3);
        (svc, store, queue)
    }

    #[tokio::test]
    async fn submit_records_message_job_and_task() {
        let (svc, store, queue) = service().await;
        let conv = Uuid::new_v4();

        let sub = svc
            .submit(conv, "desk-1", JobRequest::new("Where is grid line C?", "m"))
            .await
            .unwrap();

        assert_eq!(sub.job.status, JobStatus::Queued);
        assert_eq!(sub.job.max_retries, 3);
        assert_eq!(sub.job.client_id, "desk-1");
        assert_eq!(queue.len().await.unwrap(), 1);

        let messages = store.list_messages(conv).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sub.user_message_id);
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(store.conversation_activity(conv).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn submit_rejects_empty_question() {
        let (svc, store, queue) = service().await;
        let conv = Uuid::new_v4();
        let err = svc
            .submit(conv, "desk-1", JobRequest::new("   ", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidRequest(_))));
        assert!(queue.is_empty().await.unwrap());
        assert!(store.list_messages(conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_mode_does_not_enqueue() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let svc = JobService::new(store.clone(), None, 3);
        let sub = svc
            .submit(Uuid::new_v4(), "desk-1", JobRequest::new("q", "m"))
            .await
            .unwrap();
        assert_eq!(svc.get_job(sub.job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let (svc, _, _) = service().await;
        let err = svc.get_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn retry_only_from_failed() {
        let (svc, store, queue) = service().await;
        let sub = svc
            .submit(Uuid::new_v4(), "desk-1", JobRequest::new("q", "m"))
            .await
            .unwrap();
        let id = sub.job.id;

        let err = svc.retry(id).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotRetryable { .. })));

        let lease = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&lease).await.unwrap();
        store.claim_job(id).await.unwrap();
        store
            .update_status(
                id,
                &StatusUpdate {
                    retry_count: Some(3),
                    ..StatusUpdate::fail("exhausted")
                },
            )
            .await
            .unwrap();

        let retried = svc.retry(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 3);
        assert!(retried.error_message.is_none());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_jobs_by_conversation() {
        let (svc, _, _) = service().await;
        let conv = Uuid::new_v4();
        svc.submit(conv, "desk-1", JobRequest::new("a", "m")).await.unwrap();
        svc.submit(conv, "desk-1", JobRequest::new("b", "m")).await.unwrap();
        svc.submit(Uuid::new_v4(), "desk-1", JobRequest::new("c", "m"))
            .await
            .unwrap();

        let jobs = svc
            .list_jobs(&JobFilter {
                conversation_id: Some(conv),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].request.user_text, "b");
    }

    #[tokio::test]
    async fn submit_with_queue_down_keeps_one_queued_job() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let svc = JobService::new(store.clone(), Some(Arc::new(DownQueue)), 3);
        let conv = Uuid::new_v4();

        let sub = svc
            .submit(conv, "desk-1", JobRequest::new("q", "m"))
            .await
            .unwrap();

        // Accepted once: the caller has no reason to resubmit.
        let jobs = svc.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, sub.job.id);
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(store.list_messages(conv).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn operator_retry_with_queue_down_leaves_job_queued() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let svc = JobService::new(store.clone(), Some(Arc::new(DownQueue)), 3);
        let sub = svc
            .submit(Uuid::new_v4(), "desk-1", JobRequest::new("q", "m"))
            .await
            .unwrap();
        let id = sub.job.id;
        store.claim_job(id).await.unwrap().unwrap();
        store
            .update_status(id, &StatusUpdate::fail("auth failed"))
            .await
            .unwrap()
            .unwrap();

        let retried = svc.retry(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }
}
