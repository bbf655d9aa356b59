//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry ceiling for new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Namespace for deriving assistant message ids from job ids.
const RESULT_MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6a0b_5c1e_93f4_4d2a_8e71_0c5d_b2f9_a417);

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed; a worker is calling the model.
    Processing,
    /// Result message written.
    Completed,
    /// Gave up; `error_message` says why.
    Failed,
}

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How hard the model should think before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file already uploaded to the model provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub uri: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Region-of-interest crops are sent at high media resolution.
    #[serde(default)]
    pub is_roi: bool,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// Everything the worker needs to make the model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub user_text: String,
    pub model_name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub user_text_template: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub file_refs: Vec<FileRef>,
    /// Opaque JSON describing documents available to the model.
    #[serde(default)]
    pub context_catalog: String,
}

impl JobRequest {
    pub fn new(user_text: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            model_name: model_name.into(),
            system_prompt: String::new(),
            user_text_template: String::new(),
            thinking_level: ThinkingLevel::default(),
            thinking_budget: None,
            file_refs: Vec::new(),
            context_catalog: String::new(),
        }
    }

    /// Reject requests no model call could satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_text.trim().is_empty() {
            return Err("user_text must not be empty".to_string());
        }
        if self.model_name.trim().is_empty() {
            return Err("model_name must not be empty".to_string());
        }
        Ok(())
    }

    /// The text sent to the model: the user's question, optionally framed by
    /// the template and the context catalog.
    pub fn prompt_text(&self) -> String {
        if self.context_catalog.is_empty() {
            return self.user_text.clone();
        }
        if self.user_text_template.contains("{question}") {
            return self
                .user_text_template
                .replace("{question}", &self.user_text)
                .replace("{context_catalog}", &self.context_catalog);
        }
        format!(
            "CONTEXT CATALOG:\n{}\n\nQUESTION:\n{}",
            self.context_catalog, self.user_text
        )
    }
}

/// One structured action returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub message_id: Uuid,
    pub text: String,
    pub actions: Vec<ModelAction>,
    pub is_final: bool,
}

/// A durable job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub client_id: String,
    pub status: JobStatus,
    pub request: JobRequest,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    /// Earliest instant a queued job may be claimed.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Id of the assistant message this job writes. Stable across
    /// redeliveries so the message insert is idempotent.
    pub fn result_message_id(&self) -> Uuid {
        result_message_id(self.id)
    }

    /// Whether the retry ceiling has been reached.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Deterministic assistant message id for a job.
pub fn result_message_id(job_id: Uuid) -> Uuid {
    Uuid::new_v5(&RESULT_MESSAGE_NAMESPACE, job_id.as_bytes())
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub conversation_id: Uuid,
    pub client_id: String,
    pub request: JobRequest,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(conversation_id: Uuid, client_id: impl Into<String>, request: JobRequest) -> Self {
        Self {
            conversation_id,
            client_id: client_id.into(),
            request,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A guarded status write. Fields left `None` are not touched.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    pub available_at: Option<DateTime<Utc>>,
    /// When set, the write only applies while the job is still `processing`
    /// under the claim stamped at this `started_at`.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Back to the queue for another attempt.
    pub fn requeue(retry_count: u32, error: impl Into<String>, available_at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Queued,
            error_message: Some(error.into()),
            retry_count: Some(retry_count),
            available_at: Some(available_at),
            claimed_at: None,
        }
    }

    /// Terminal failure.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(error.into()),
            retry_count: None,
            available_at: None,
            claimed_at: None,
        }
    }

    /// Tie the write to one claim of the job.
    pub fn for_claim(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.claimed_at = started_at;
        self
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFilter {
    pub conversation_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            conversation_id: None,
            client_id: None,
            status: None,
            limit: 50,
        }
    }
}
