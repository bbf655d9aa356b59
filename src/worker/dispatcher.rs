//! Dispatcher — runs one delivered job to its next state.
//!
//! Each delivery is re-validated against the job row before anything is
//! done: the queue may redeliver, and other workers may have moved the job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::source::{Delivery, JobSource};
use crate::agent::{AgentReply, AskRequest, HistoryMessage, ModelAgent};
use crate::error::{AgentError, Error};
use crate::jobs::model::{Job, JobResult, JobStatus, ModelAction, StatusUpdate};
use crate::jobs::retry::{FailReason, RetryDecision, RetryPolicy};
use crate::store::{
    ConversationMessage, ConversationStore, JobStore, MessageRole, MessageStore, NewMessage, Store,
};
use crate::trace::{Trace, TraceRecorder};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on one model call.
    pub job_timeout: Duration,
    /// How many earlier user/assistant pairs are sent as history.
    pub history_pairs: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            history_pairs: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    /// Requeued for another attempt.
    Retrying { retry_count: u32, delay: Duration },
    Failed,
    /// Nothing to do: job missing, terminal, or held by someone else.
    Skipped,
}

/// Processes deliveries. Shared by all workers of a group.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    agent: Arc<dyn ModelAgent>,
    source: Arc<dyn JobSource>,
    traces: Arc<TraceRecorder>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<dyn ModelAgent>,
        source: Arc<dyn JobSource>,
        traces: Arc<TraceRecorder>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            agent,
            source,
            traces,
            config,
        }
    }

    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Handle one delivery end to end.
    ///
    /// Model failures are resolved here (retry or fail) and reported as an
    /// `Outcome`. Only storage errors are returned; the delivery is then left
    /// unacked so it comes back.
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome, Error> {
        let job = match &delivery {
            Delivery::Claimed(job) => job.clone(),
            Delivery::Task(_) => match self.claim_for_task(delivery.job_id()).await? {
                Some(job) => job,
                None => {
                    self.source.ack(&delivery).await?;
                    return Ok(Outcome::Skipped);
                }
            },
        };

        let outcome = self.process(&job).await?;
        self.source.ack(&delivery).await?;
        Ok(outcome)
    }

    /// Re-check the row behind a task and claim it if still queued.
    async fn claim_for_task(&self, job_id: uuid::Uuid) -> Result<Option<Job>, Error> {
        let Some(job) = self.store.get_job(job_id).await? else {
            debug!(job_id = %job_id, "Task for missing job, discarding");
            return Ok(None);
        };

        match job.status {
            JobStatus::Queued => {}
            JobStatus::Processing => {
                debug!(job_id = %job_id, "Job held by another worker, discarding task");
                return Ok(None);
            }
            status => {
                debug!(job_id = %job_id, status = %status, "Job already terminal, discarding task");
                return Ok(None);
            }
        }

        let claimed = self.store.claim_job(job_id).await?;
        if claimed.is_none() {
            debug!(job_id = %job_id, "Lost claim race, discarding task");
        }
        Ok(claimed)
    }

    /// Run a claimed job.
    async fn process(&self, job: &Job) -> Result<Outcome, Error> {
        if let Some(existing) = self.store.get_message(job.result_message_id()).await? {
            info!(job_id = %job.id, "Result message already stored, completing without model call");
            return self.complete_from_message(job, &existing).await;
        }

        let history = self.history_for(job).await?;
        let request = AskRequest::for_job(job, history);
        let trace = Trace::begin(Some(job.id), job.conversation_id, &request);

        info!(
            job_id = %job.id,
            attempt = job.retry_count + 1,
            model = %request.model,
            agent = self.agent.name(),
            "Processing job"
        );

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.job_timeout, self.agent.ask(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.config.job_timeout)),
        };

        match result {
            Ok(reply) => {
                self.traces.add(trace.succeeded(&reply)).await;
                self.complete(job, &reply).await
            }
            Err(err) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.traces.add(trace.failed(&err, latency_ms)).await;
                self.resolve_failure(job, &err).await
            }
        }
    }

    async fn complete(&self, job: &Job, reply: &AgentReply) -> Result<Outcome, Error> {
        let message_id = job.result_message_id();
        let meta = serde_json::json!({
            "job_id": job.id,
            "model": job.request.model_name,
            "thinking_level": job.request.thinking_level,
            "actions": reply.actions,
            "is_final": reply.is_final,
            "input_tokens": reply.input_tokens,
            "output_tokens": reply.output_tokens,
            "latency_ms": reply.latency_ms,
        });
        self.store
            .add_message(&NewMessage {
                id: message_id,
                conversation_id: job.conversation_id,
                role: MessageRole::Assistant,
                content: reply.assistant_text.clone(),
                meta,
            })
            .await?;

        let result = JobResult {
            message_id,
            text: reply.assistant_text.clone(),
            actions: reply.actions.clone(),
            is_final: reply.is_final,
        };
        self.finish(job, &result).await
    }

    async fn complete_from_message(
        &self,
        job: &Job,
        message: &ConversationMessage,
    ) -> Result<Outcome, Error> {
        let actions: Vec<ModelAction> = message
            .meta
            .get("actions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let is_final = message
            .meta
            .get("is_final")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let result = JobResult {
            message_id: message.id,
            text: message.content.clone(),
            actions,
            is_final,
        };
        debug!(job_id = %job.id, message_id = %message.id, "Recovered result from stored message");
        let trace = Trace::begin(
            Some(job.id),
            job.conversation_id,
            &AskRequest::for_job(job, Vec::new()),
        );
        self.traces.add(trace.recovered(&result)).await;
        self.finish(job, &result).await
    }

    async fn finish(&self, job: &Job, result: &JobResult) -> Result<Outcome, Error> {
        match self.store.complete_job(job.id, result).await? {
            Some(_) => {
                info!(job_id = %job.id, is_final = result.is_final, "Job completed");
                self.store.touch_conversation(job.conversation_id).await?;
                Ok(Outcome::Completed)
            }
            None => {
                debug!(job_id = %job.id, "Job already terminal, completion skipped");
                Ok(Outcome::Skipped)
            }
        }
    }

    /// Apply the retry policy to a failed attempt of `job`.
    ///
    /// `job` is the snapshot taken at claim time. The write only lands while
    /// that claim is current; otherwise the outcome is `Skipped`.
    pub async fn resolve_failure(&self, job: &Job, err: &AgentError) -> Result<Outcome, Error> {
        match self.config.retry.decide(job, err) {
            RetryDecision::Retry { retry_count, delay } => {
                warn!(
                    job_id = %job.id,
                    attempt = retry_count,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job attempt failed, retrying"
                );
                let available_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let update = StatusUpdate::requeue(retry_count, err.to_string(), available_at)
                    .for_claim(job.started_at);
                match self.store.update_status(job.id, &update).await? {
                    Some(requeued) => {
                        self.source.schedule(&requeued, delay).await?;
                        Ok(Outcome::Retrying { retry_count, delay })
                    }
                    None => {
                        debug!(job_id = %job.id, "Job terminal or claimed again, retry skipped");
                        Ok(Outcome::Skipped)
                    }
                }
            }
            RetryDecision::Fail { reason } => {
                match reason {
                    FailReason::Exhausted => error!(
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        max_retries = job.max_retries,
                        error = %err,
                        "Job failed, retries exhausted"
                    ),
                    FailReason::NonRetryable => error!(
                        job_id = %job.id,
                        error = %err,
                        "Job failed with non-retryable error"
                    ),
                }
                match self
                    .store
                    .update_status(
                        job.id,
                        &StatusUpdate::fail(err.to_string()).for_claim(job.started_at),
                    )
                    .await?
                {
                    Some(_) => Ok(Outcome::Failed),
                    None => Ok(Outcome::Skipped),
                }
            }
        }
    }

    /// Last `history_pairs` user/assistant pairs before this job, oldest first.
    async fn history_for(&self, job: &Job) -> Result<Vec<HistoryMessage>, Error> {
        if self.config.history_pairs == 0 {
            return Ok(Vec::new());
        }
        let job_id = serde_json::Value::String(job.id.to_string());
        let mut history: Vec<HistoryMessage> = self
            .store
            .list_messages(job.conversation_id)
            .await?
            .into_iter()
            .filter(|m| m.meta.get("job_id") != Some(&job_id))
            .filter(|m| m.created_at <= job.created_at)
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content,
            })
            .collect();

        let keep = self.config.history_pairs * 2;
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobRequest, NewJob};
    use crate::queue::{InMemoryTaskQueue, Task, TaskQueue};
    use crate::store::LibSqlBackend;
    use crate::worker::source::{PollSource, QueueSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Replays scripted results, then keeps answering "ok".
    struct ScriptedAgent {
        script: Mutex<Vec<Result<AgentReply, AgentError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<AskRequest>>,
    }

    impl ScriptedAgent {
        fn new(mut script: Vec<Result<AgentReply, AgentError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    fn ok_reply(text: &str) -> AgentReply {
        AgentReply {
            assistant_text: text.into(),
            actions: vec![],
            is_final: true,
            input_tokens: Some(3),
            output_tokens: Some(1),
            latency_ms: 1,
        }
    }

    fn transient() -> AgentError {
        AgentError::Transient {
            provider: "stub".into(),
            reason: "503".into(),
        }
    }

    #[async_trait]
    impl ModelAgent for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn ask(&self, request: &AskRequest) -> Result<AgentReply, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().await.push(request.clone());
            self.script.lock().await.pop().unwrap_or_else(|| Ok(ok_reply("ok")))
        }
    }

    struct Harness {
        store: Arc<LibSqlBackend>,
        queue: Arc<InMemoryTaskQueue>,
        traces: Arc<TraceRecorder>,
        dispatcher: Dispatcher,
    }

    async fn harness(agent: Arc<dyn ModelAgent>) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30)));
        let traces = Arc::new(TraceRecorder::new(50));
        let source = Arc::new(QueueSource::new(queue.clone(), Duration::ZERO));
        let dispatcher = Dispatcher::new(
            store.clone(),
            agent,
            source,
            traces.clone(),
            DispatcherConfig {
                job_timeout: Duration::from_secs(5),
                history_pairs: 2,
                retry: RetryPolicy::immediate(),
            },
        );
        Harness {
            store,
            queue,
            traces,
            dispatcher,
        }
    }

    async fn submit(h: &Harness, max_retries: u32) -> Job {
        let job = h
            .store
            .create_job(
                &NewJob::new(Uuid::new_v4(), "desk-1", JobRequest::new("q?", "m"))
                    .with_max_retries(max_retries),
            )
            .await
            .unwrap();
        h.queue.enqueue(Task::for_job(&job), Duration::ZERO).await.unwrap();
        job
    }

    async fn deliver(h: &Harness) -> Outcome {
        let lease = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        h.dispatcher.handle(Delivery::Task(lease)).await.unwrap()
    }

    #[tokio::test]
    async fn success_writes_message_and_completes() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;

        assert_eq!(deliver(&h).await, Outcome::Completed);

        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.text, "ok");
        assert!(result.is_final);

        let messages = h.store.list_messages(job.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, job.result_message_id());
        assert_eq!(messages[0].meta["job_id"], job.id.to_string());

        assert!(h.store.conversation_activity(job.conversation_id).await.unwrap().is_some());
        assert!(h.queue.is_empty().await.unwrap());
        assert_eq!(h.traces.len().await, 1);
    }

    #[tokio::test]
    async fn retries_until_ceiling_then_fails() {
        let agent = ScriptedAgent::new((0..4).map(|_| Err(transient())).collect());
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;

        for expected in 1..=3 {
            assert_eq!(
                deliver(&h).await,
                Outcome::Retrying {
                    retry_count: expected,
                    delay: Duration::ZERO
                }
            );
        }
        assert_eq!(deliver(&h).await, Outcome::Failed);

        let failed = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error_message.unwrap().contains("503"));
        assert!(h.queue.is_empty().await.unwrap(), "no fifth delivery");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.traces.len().await, 4);
        assert!(h.store.list_messages(job.conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_error_fails_immediately() {
        let agent = ScriptedAgent::new(vec![Err(AgentError::Validation("bad model".into()))]);
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;

        assert_eq!(deliver(&h).await, Outcome::Failed);
        let failed = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn redelivery_of_terminal_job_is_discarded() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;
        assert_eq!(deliver(&h).await, Outcome::Completed);

        h.queue.enqueue(Task::for_job(&job), Duration::ZERO).await.unwrap();
        assert_eq!(deliver(&h).await, Outcome::Skipped);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn processing_job_task_is_discarded() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;
        h.store.claim_job(job.id).await.unwrap().unwrap();

        assert_eq!(deliver(&h).await, Outcome::Skipped);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stored_result_completes_without_model_call() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent.clone()).await;
        let job = submit(&h, 3).await;
        h.store
            .add_message(&NewMessage {
                id: job.result_message_id(),
                conversation_id: job.conversation_id,
                role: MessageRole::Assistant,
                content: "written before crash".into(),
                meta: serde_json::json!({"job_id": job.id, "is_final": true, "actions": []}),
            })
            .await
            .unwrap();

        assert_eq!(deliver(&h).await, Outcome::Completed);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        let result = done.result.unwrap();
        assert_eq!(result.text, "written before crash");
        assert!(result.is_final);

        let traces = h.traces.list().await;
        assert_eq!(traces.len(), 1);
        assert!(traces[0].recovered);
        assert_eq!(traces[0].job_id, Some(job.id));
        assert_eq!(traces[0].response.as_deref(), Some("written before crash"));
    }

    #[tokio::test]
    async fn superseded_claim_cannot_requeue() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent).await;
        let job = submit(&h, 3).await;
        let lease = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        h.queue.ack(&lease).await.unwrap();

        // Worker A claims, its claim is recovered, worker B claims again.
        let a = h.store.claim_job(job.id).await.unwrap().unwrap();
        h.store
            .update_status(
                job.id,
                &StatusUpdate::requeue(1, "worker lost", Utc::now()).for_claim(a.started_at),
            )
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = h.store.claim_job(job.id).await.unwrap().unwrap();
        assert_ne!(a.started_at, b.started_at);

        // A reports late with its old snapshot.
        let err = AgentError::Unclassified("late".into());
        assert_eq!(h.dispatcher.resolve_failure(&a, &err).await.unwrap(), Outcome::Skipped);

        let held = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(held.status, JobStatus::Processing);
        assert_eq!(held.started_at, b.started_at);
        assert_eq!(held.retry_count, 1);
        assert!(h.store.claim_job(job.id).await.unwrap().is_none());
        assert!(h.queue.is_empty().await.unwrap());

        // Terminal failure from the stale snapshot is fenced too.
        let fatal = AgentError::Validation("bad".into());
        assert_eq!(h.dispatcher.resolve_failure(&a, &fatal).await.unwrap(), Outcome::Skipped);
        assert_eq!(
            h.store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        // B's own failure still applies.
        assert!(matches!(
            h.dispatcher.resolve_failure(&b, &err).await.unwrap(),
            Outcome::Retrying { retry_count: 2, .. }
        ));
    }

    struct SlowAgent;

    #[async_trait]
    impl ModelAgent for SlowAgent {
        fn name(&self) -> &str {
            "slow"
        }

        async fn ask(&self, _request: &AskRequest) -> Result<AgentReply, AgentError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ok_reply("too late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retryable() {
        let h = harness(Arc::new(SlowAgent)).await;
        let job = submit(&h, 3).await;

        assert!(matches!(
            deliver(&h).await,
            Outcome::Retrying { retry_count: 1, .. }
        ));
        let requeued = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.error_message.unwrap().contains("timed out"));
        assert!(requeued.started_at.is_none());

        let traces = h.traces.list().await;
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].errors.len(), 1);
    }

    #[tokio::test]
    async fn history_excludes_current_job_and_is_bounded() {
        let agent = ScriptedAgent::new(vec![]);
        let h = harness(agent.clone()).await;
        let conversation_id = Uuid::new_v4();

        for i in 0..3 {
            for (role, text) in [(MessageRole::User, "q"), (MessageRole::Assistant, "a")] {
                h.store
                    .add_message(&NewMessage {
                        id: Uuid::new_v4(),
                        conversation_id,
                        role,
                        content: format!("{text}{i}"),
                        meta: serde_json::json!({}),
                    })
                    .await
                    .unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        let job = h
            .store
            .create_job(&NewJob::new(conversation_id, "desk-1", JobRequest::new("q3", "m")))
            .await
            .unwrap();
        h.store
            .add_message(&NewMessage {
                id: Uuid::new_v4(),
                conversation_id,
                role: MessageRole::User,
                content: "q3".into(),
                meta: serde_json::json!({"job_id": job.id}),
            })
            .await
            .unwrap();
        h.queue.enqueue(Task::for_job(&job), Duration::ZERO).await.unwrap();

        assert_eq!(deliver(&h).await, Outcome::Completed);
        let seen = agent.seen.lock().await;
        let history: Vec<&str> = seen[0].history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["q1", "a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn poll_delivery_is_processed() {
        let agent = ScriptedAgent::new(vec![]);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let source: Arc<dyn JobSource> =
            Arc::new(PollSource::new(store.clone(), Duration::from_millis(1)));
        let dispatcher = Dispatcher::new(
            store.clone(),
            agent,
            source.clone(),
            Arc::new(TraceRecorder::default()),
            DispatcherConfig {
                retry: RetryPolicy::immediate(),
                ..Default::default()
            },
        );
        let job = store
            .create_job(&NewJob::new(Uuid::new_v4(), "desk-1", JobRequest::new("q", "m")))
            .await
            .unwrap();

        let delivery = source.next().await.unwrap().unwrap();
        assert_eq!(dispatcher.handle(delivery).await.unwrap(), Outcome::Completed);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
