//! Storage traits — one interface per responsibility.
//!
//! `LibSqlBackend` implements all of them; callers that need everything take
//! `Arc<dyn Store>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobFilter, JobResult, NewJob, StatusUpdate};

/// Durable job lifecycle records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `queued` state.
    async fn create_job(&self, new_job: &NewJob) -> Result<Job, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// List jobs, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// Claim the oldest claimable queued job. Returns `None` when there is
    /// nothing to claim or every candidate was taken by another caller.
    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError>;

    /// Claim one specific job. Returns `None` if it is no longer queued.
    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Guarded status write. Returns `None` (and writes nothing) when the job
    /// is missing or already terminal, or when `update.claimed_at` no longer
    /// names the current claim.
    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Guarded transition to `completed`. Returns `None` when the job is
    /// missing or already terminal.
    async fn complete_job(&self, id: Uuid, result: &JobResult)
    -> Result<Option<Job>, DatabaseError>;

    /// Operator retry: `failed → queued`, retry count kept. Returns `None`
    /// unless the job was failed.
    async fn reset_failed(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Jobs stuck in `processing` since before `started_before`.
    async fn list_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs still `queued` although they became claimable before
    /// `available_before`; their delivery may have been lost.
    async fn list_overdue_queued(
        &self,
        available_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// A message to append to a conversation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Caller-chosen id; inserting the same id twice is a no-op.
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub meta: serde_json::Value,
}

/// A stored conversation message.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only conversation messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message. Idempotent on `message.id`; returns the id.
    async fn add_message(&self, message: &NewMessage) -> Result<Uuid, DatabaseError>;

    /// Get a message by ID.
    async fn get_message(&self, id: Uuid) -> Result<Option<ConversationMessage>, DatabaseError>;

    /// List messages in a conversation, oldest first.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;
}

/// Conversation bookkeeping.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Bump the conversation's activity timestamp, creating the row if needed.
    async fn touch_conversation(&self, conversation_id: Uuid) -> Result<(), DatabaseError>;

    /// Last activity time, if the conversation exists.
    async fn conversation_activity(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;
}

/// Everything the pipeline persists.
pub trait Store: JobStore + MessageStore + ConversationStore {}

impl<T: JobStore + MessageStore + ConversationStore> Store for T {}
