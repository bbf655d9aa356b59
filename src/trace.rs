//! In-memory audit trail of model invocations.
//!
//! A fixed-capacity ring buffer: the oldest trace is evicted when a new one
//! would exceed capacity. Nothing here is persisted.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::{AgentReply, AskRequest};
use crate::jobs::model::{FileRef, JobResult, ModelAction, ThinkingLevel};

/// Default number of traces kept.
pub const DEFAULT_TRACE_CAPACITY: usize = 200;

/// One model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub system_prompt: String,
    pub user_text: String,
    pub input_files: Vec<FileRef>,
    pub response: Option<String>,
    pub parsed_actions: Vec<ModelAction>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: u64,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
    /// The reply was taken from an already stored message; no model call.
    #[serde(default)]
    pub recovered: bool,
}

impl Trace {
    /// Start a trace for `request`; fill in the outcome with
    /// [`Trace::succeeded`] or [`Trace::failed`].
    pub fn begin(job_id: Option<Uuid>, conversation_id: Uuid, request: &AskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            conversation_id,
            model: request.model.clone(),
            thinking_level: request.thinking_level,
            system_prompt: request.system_prompt.clone(),
            user_text: request.user_text.clone(),
            input_files: request.file_refs.clone(),
            response: None,
            parsed_actions: Vec::new(),
            input_tokens: None,
            output_tokens: None,
            latency_ms: 0,
            errors: Vec::new(),
            timestamp: Utc::now(),
            is_final: false,
            recovered: false,
        }
    }

    pub fn succeeded(mut self, reply: &AgentReply) -> Self {
        self.response = Some(reply.assistant_text.clone());
        self.parsed_actions = reply.actions.clone();
        self.input_tokens = reply.input_tokens;
        self.output_tokens = reply.output_tokens;
        self.latency_ms = reply.latency_ms;
        self.is_final = reply.is_final;
        self
    }

    /// Outcome restored from a result that was already written.
    pub fn recovered(mut self, result: &JobResult) -> Self {
        self.response = Some(result.text.clone());
        self.parsed_actions = result.actions.clone();
        self.is_final = result.is_final;
        self.recovered = true;
        self
    }

    pub fn failed(mut self, error: impl ToString, latency_ms: u64) -> Self {
        self.errors.push(error.to_string());
        self.latency_ms = latency_ms;
        self
    }
}

#[derive(Default)]
struct Ring {
    order: VecDeque<Uuid>,
    by_id: HashMap<Uuid, Trace>,
}

/// Bounded, concurrently writable trace store.
pub struct TraceRecorder {
    capacity: usize,
    inner: RwLock<Ring>,
}

impl TraceRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Ring::default()),
        }
    }

    /// Record a trace, evicting the oldest beyond capacity.
    pub async fn add(&self, trace: Trace) {
        let mut ring = self.inner.write().await;
        if ring.by_id.contains_key(&trace.id) {
            ring.order.retain(|id| *id != trace.id);
        }
        ring.order.push_back(trace.id);
        ring.by_id.insert(trace.id, trace);

        while ring.order.len() > self.capacity {
            if let Some(evicted) = ring.order.pop_front() {
                ring.by_id.remove(&evicted);
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<Trace> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    /// All traces, newest first.
    pub async fn list(&self) -> Vec<Trace> {
        let ring = self.inner.read().await;
        ring.order
            .iter()
            .rev()
            .filter_map(|id| ring.by_id.get(id).cloned())
            .collect()
    }

    pub async fn clear(&self) {
        let mut ring = self.inner.write().await;
        ring.order.clear();
        ring.by_id.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}
