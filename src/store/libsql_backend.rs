//! libSQL backend — implements `JobStore`, `MessageStore`, and
//! `ConversationStore` over one connection.
//!
//! Every applied job write is mirrored to `JobEvents` subscribers when an
//! event channel is attached.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::events::JobEvents;
use crate::jobs::model::{
    Job, JobFilter, JobRequest, JobResult, JobStatus, ModelAction, NewJob, StatusUpdate,
};
use crate::store::migrations;
use crate::store::traits::{
    ConversationMessage, ConversationStore, JobStore, MessageRole, MessageStore, NewMessage,
};

/// How many queued candidates `claim_next` tries before giving up.
const CLAIM_CANDIDATES: i64 = 8;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    events: Option<JobEvents>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        configure_file_connection(&conn).await;

        let backend = Self {
            db: Arc::new(db),
            conn,
            events: None,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            events: None,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Mirror applied job writes to `events`.
    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn publish(&self, job: &Job) {
        if let Some(ref events) = self.events {
            events.publish(job);
        }
    }

    /// Re-read a job after a write that changed `changed` rows.
    async fn reload_if_changed(
        &self,
        id: Uuid,
        changed: u64,
    ) -> Result<Option<Job>, DatabaseError> {
        if changed == 0 {
            return Ok(None);
        }
        let job = self.get_job(id).await?;
        if let Some(ref job) = job {
            self.publish(job);
        }
        Ok(job)
    }
}

/// Settings for file-backed databases shared between processes.
pub(crate) async fn configure_file_connection(conn: &Connection) {
    for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA busy_timeout = 5000"] {
        if let Err(e) = conn.query(pragma, ()).await {
            warn!(pragma, error = %e, "Failed to apply connection pragma");
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp; text order matches time order.
pub(crate) fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Column list for job SELECT queries (17 columns).
const JOB_COLUMNS: &str = "id, conversation_id, client_id, status, request, retry_count, max_retries, result_message_id, result_text, result_actions, result_is_final, error_message, available_at, created_at, started_at, completed_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, meta, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let conv_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.conversation_id: {e}")))?;
    let conversation_id = Uuid::parse_str(&conv_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.conversation_id parse: {e}")))?;

    let client_id: String = row.get(2).unwrap_or_else(|_| "default".to_string());

    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let request_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("job.request: {e}")))?;
    let request: JobRequest = serde_json::from_str(&request_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.request: {e}")))?;

    let retry_count: i64 = row.get(5).unwrap_or(0);
    let max_retries: i64 = row.get(6).unwrap_or(0);

    let result_message_id: Option<String> = row.get::<String>(7).ok();
    let result = match result_message_id.and_then(|s| Uuid::parse_str(&s).ok()) {
        Some(message_id) if status == JobStatus::Completed => {
            let text: String = row.get(8).unwrap_or_default();
            let actions: Vec<ModelAction> = row
                .get::<String>(9)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            let is_final = row.get::<i64>(10).unwrap_or(0) != 0;
            Some(JobResult {
                message_id,
                text,
                actions,
                is_final,
            })
        }
        _ => None,
    };

    let error_message: Option<String> = row.get::<String>(11).ok();
    let available_str: String = row.get(12).unwrap_or_default();
    let created_str: String = row.get(13).unwrap_or_default();
    let started_str: Option<String> = row.get::<String>(14).ok();
    let completed_str: Option<String> = row.get::<String>(15).ok();
    let updated_str: String = row.get(16).unwrap_or_default();

    Ok(Job {
        id,
        conversation_id,
        client_id,
        status,
        request,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        result,
        error_message,
        available_at: parse_datetime(&available_str),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<ConversationMessage, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("message.id: {e}")))?;
    let conv_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("message.conversation_id: {e}")))?;
    let role_str: String = row.get(2).unwrap_or_else(|_| "user".to_string());
    let content: String = row.get(3).unwrap_or_default();
    let meta_str: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let created_str: String = row.get(5).unwrap_or_default();

    Ok(ConversationMessage {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("message.id parse: {e}")))?,
        conversation_id: Uuid::parse_str(&conv_str).unwrap_or_else(|_| Uuid::nil()),
        role: role_str.parse().unwrap_or(MessageRole::User),
        content,
        meta: serde_json::from_str(&meta_str).unwrap_or(serde_json::json!({})),
        created_at: parse_datetime(&created_str),
    })
}

async fn collect_jobs(mut rows: libsql::Rows) -> Vec<Job> {
    let mut jobs = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match row_to_job(&row) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping job row: {e}"),
        }
    }
    jobs
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create_job(&self, new_job: &NewJob) -> Result<Job, DatabaseError> {
        let id = Uuid::new_v4();
        let now = fmt_datetime(Utc::now());
        let request = serde_json::to_string(&new_job.request)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, conversation_id, client_id, status, request,
                    retry_count, max_retries, available_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?6, ?6, ?6)",
                params![
                    id.to_string(),
                    new_job.conversation_id.to_string(),
                    new_job.client_id.clone(),
                    request,
                    new_job.max_retries as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        let job = self.get_job(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })?;
        debug!(job_id = %id, conversation_id = %job.conversation_id, "Job created");
        self.publish(&job);
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(conversation_id) = filter.conversation_id {
            values.push(libsql::Value::Text(conversation_id.to_string()));
            clauses.push(format!("conversation_id = ?{}", values.len()));
        }
        if let Some(ref client_id) = filter.client_id {
            values.push(libsql::Value::Text(client_id.clone()));
            clauses.push(format!("client_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(filter.limit as i64));
        let limit_param = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs {where_sql}
                     ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_param}"
                ),
                values,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        Ok(collect_jobs(rows).await)
    }

    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM jobs
                 WHERE status = 'queued' AND available_at <= ?1
                 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
                params![now, CLAIM_CANDIDATES],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Some(id) = row
                .get::<String>(0)
                .ok()
                .and_then(|s| Uuid::parse_str(&s).ok())
            {
                candidates.push(id);
            }
        }

        for id in candidates {
            if let Some(job) = self.claim_job(id).await? {
                return Ok(Some(job));
            }
            debug!(job_id = %id, "Lost claim race, trying next candidate");
        }
        Ok(None)
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'processing', started_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))?;

        let job = self.reload_if_changed(id, changed).await?;
        if job.is_some() {
            debug!(job_id = %id, "Job claimed");
        }
        Ok(job)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<Job>, DatabaseError> {
        let now = Utc::now();
        let now_str = fmt_datetime(now);
        let completed_at = if update.status.is_terminal() {
            Some(now_str.clone())
        } else {
            None
        };
        // Requeue clears the claim so the next attempt stamps a fresh start.
        let clear_started = update.status == JobStatus::Queued;

        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET
                    status = ?2,
                    error_message = COALESCE(?3, error_message),
                    retry_count = COALESCE(?4, retry_count),
                    available_at = COALESCE(?5, available_at),
                    started_at = CASE WHEN ?6 THEN NULL ELSE started_at END,
                    completed_at = COALESCE(?7, completed_at),
                    updated_at = ?8
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed')
                   AND (?9 IS NULL OR (status = 'processing' AND started_at = ?9))",
                params![
                    id.to_string(),
                    update.status.as_str(),
                    opt_text_owned(update.error_message.clone()),
                    opt_int(update.retry_count.map(i64::from)),
                    opt_text_owned(update.available_at.map(fmt_datetime)),
                    clear_started as i64,
                    opt_text_owned(completed_at),
                    now_str,
                    opt_text_owned(update.claimed_at.map(fmt_datetime)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if changed == 0 {
            debug!(job_id = %id, status = %update.status, "Status update skipped (terminal, missing or claim superseded)");
        }
        self.reload_if_changed(id, changed).await
    }

    async fn complete_job(
        &self,
        id: Uuid,
        result: &JobResult,
    ) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let actions = serde_json::to_string(&result.actions)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET
                    status = 'completed',
                    result_message_id = ?2,
                    result_text = ?3,
                    result_actions = ?4,
                    result_is_final = ?5,
                    error_message = NULL,
                    completed_at = ?6,
                    updated_at = ?6
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
                params![
                    id.to_string(),
                    result.message_id.to_string(),
                    result.text.clone(),
                    actions,
                    result.is_final as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        if changed == 0 {
            debug!(job_id = %id, "Completion skipped (terminal or missing)");
        }
        self.reload_if_changed(id, changed).await
    }

    async fn reset_failed(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET
                    status = 'queued',
                    error_message = NULL,
                    started_at = NULL,
                    completed_at = NULL,
                    available_at = ?2,
                    updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'",
                params![id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_failed: {e}")))?;

        self.reload_if_changed(id, changed).await
    }

    async fn list_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'processing' AND started_at < ?1
                     ORDER BY started_at ASC"
                ),
                params![fmt_datetime(started_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale: {e}")))?;

        Ok(collect_jobs(rows).await)
    }

    async fn list_overdue_queued(
        &self,
        available_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'queued' AND available_at < ?1
                     ORDER BY available_at ASC"
                ),
                params![fmt_datetime(available_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_overdue_queued: {e}")))?;

        Ok(collect_jobs(rows).await)
    }
}

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn add_message(&self, message: &NewMessage) -> Result<Uuid, DatabaseError> {
        let meta = serde_json::to_string(&message.meta)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversation_messages
                    (id, conversation_id, role, content, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.role.as_str(),
                    message.content.clone(),
                    meta,
                    fmt_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_message: {e}")))?;

        if changed == 0 {
            debug!(message_id = %message.id, "Message already stored");
        }
        Ok(message.id)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<ConversationMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
                     WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn touch_conversation(&self, conversation_id: Uuid) -> Result<(), DatabaseError> {
        let now = fmt_datetime(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO conversations (id, created_at, last_activity)
                 VALUES (?1, ?2, ?2)
                 ON CONFLICT (id) DO UPDATE SET last_activity = ?2",
                params![conversation_id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_conversation: {e}")))?;
        Ok(())
    }

    async fn conversation_activity(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_activity FROM conversations WHERE id = ?1",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conversation_activity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row.get(0).unwrap_or_default();
                Ok(Some(parse_datetime(&s)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("conversation_activity: {e}"))),
        }
    }
}
