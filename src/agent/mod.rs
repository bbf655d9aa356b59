//! Model agent — turns a job request into a structured reply.
//!
//! The pipeline only sees the `ModelAgent` trait. `GeminiAgent` is the HTTP
//! adapter shipped with the crate; tests use stubs.

pub mod gemini;
pub mod reply;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::jobs::model::{FileRef, Job, ModelAction, ThinkingLevel};
use crate::store::MessageRole;

pub use gemini::{GeminiAgent, GeminiConfig};
pub use reply::parse_model_reply;

/// One earlier turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Everything the model needs for one call.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub user_text: String,
    pub file_refs: Vec<FileRef>,
    pub model: String,
    pub system_prompt: String,
    pub thinking_level: ThinkingLevel,
    pub thinking_budget: Option<u32>,
    /// Earlier turns, oldest first.
    pub history: Vec<HistoryMessage>,
}

impl AskRequest {
    /// Build the call for `job`, with the prompt framed by its context catalog.
    pub fn for_job(job: &Job, history: Vec<HistoryMessage>) -> Self {
        let request = &job.request;
        Self {
            user_text: request.prompt_text(),
            file_refs: request.file_refs.clone(),
            model: request.model_name.clone(),
            system_prompt: request.system_prompt.clone(),
            thinking_level: request.thinking_level,
            thinking_budget: request.thinking_budget,
            history,
        }
    }
}

/// Structured model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub assistant_text: String,
    pub actions: Vec<ModelAction>,
    pub is_final: bool,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: u64,
}

/// A model backend.
#[async_trait]
pub trait ModelAgent: Send + Sync {
    /// Provider name, for logs and traces.
    fn name(&self) -> &str;

    /// Make one model call. Errors are classified for the retry policy.
    async fn ask(&self, request: &AskRequest) -> Result<AgentReply, AgentError>;
}
