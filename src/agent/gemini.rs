//! Gemini adapter — `generateContent` over HTTP with JSON response mode.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{AgentReply, AskRequest, ModelAgent, parse_model_reply};
use crate::error::AgentError;
use crate::jobs::model::{FileRef, ThinkingLevel};
use crate::store::MessageRole;

const PROVIDER: &str = "gemini";

/// Public endpoint of the Generative Language API.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Used when a job carries no system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You answer questions about the documents in the \
context catalog. Reply with JSON: assistant_text, actions, is_final. Request files or image \
regions through actions when the answer needs them; set is_final once the answer is complete.";

/// Gemini connection settings.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub base_url: String,
    /// Per-request HTTP timeout; the worker applies its own job timeout too.
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// Gemini model agent.
pub struct GeminiAgent {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiAgent {
    pub fn new(config: GeminiConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AgentError::Unclassified(format!("Failed to build HTTP client: {e}")))?;
        info!(base_url = %config.base_url, "Gemini agent ready");
        Ok(Self { config, client })
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{model}:generateContent",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

/// Build the `generateContent` request body.
pub fn build_request_body(request: &AskRequest) -> Value {
    let mut contents: Vec<Value> = request
        .history
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| {
            let role = match m.role {
                MessageRole::Assistant => "model",
                _ => "user",
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    // Files first, then the question.
    let mut parts: Vec<Value> = request.file_refs.iter().filter_map(file_part).collect();
    if !request.user_text.is_empty() {
        parts.push(json!({ "text": request.user_text }));
    }
    contents.push(json!({ "role": "user", "parts": parts }));

    let mut thinking = json!({ "thinkingLevel": request.thinking_level.as_str() });
    if let Some(budget) = request.thinking_budget {
        thinking["thinkingBudget"] = json!(budget);
    }

    let system_prompt = if request.system_prompt.trim().is_empty() {
        DEFAULT_SYSTEM_PROMPT
    } else {
        request.system_prompt.as_str()
    };

    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": contents,
        "generationConfig": {
            "responseMimeType": "application/json",
            "temperature": 1.0,
            "thinkingConfig": thinking,
            "mediaResolution": media_resolution(request),
        }
    })
}

fn file_part(file: &FileRef) -> Option<Value> {
    if file.uri.is_empty() {
        return None;
    }
    // JSON uploads are read as plain text by the model.
    let mime = if file.mime_type == "application/json" {
        "text/plain"
    } else {
        file.mime_type.as_str()
    };
    Some(json!({ "fileData": { "fileUri": file.uri, "mimeType": mime } }))
}

/// High resolution when any region-of-interest crop is attached.
fn media_resolution(request: &AskRequest) -> &'static str {
    if request.file_refs.iter().any(|f| f.is_roi) {
        "MEDIA_RESOLUTION_HIGH"
    } else {
        match request.thinking_level {
            ThinkingLevel::High => "MEDIA_RESOLUTION_MEDIUM",
            _ => "MEDIA_RESOLUTION_LOW",
        }
    }
}

/// Token usage reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Extract the reply text (thought parts skipped) and usage from a response.
pub fn extract_response(body: &Value) -> Result<(String, Usage), AgentError> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| match body.pointer("/promptFeedback/blockReason") {
            Some(reason) => AgentError::Validation(format!("prompt blocked: {reason}")),
            None => AgentError::Unclassified("response has no candidates".to_string()),
        })?;

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let token_count = |key: &str| {
        body.pointer(&format!("/usageMetadata/{key}"))
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    };
    let usage = Usage {
        input_tokens: token_count("promptTokenCount"),
        output_tokens: token_count("candidatesTokenCount"),
    };
    Ok((text, usage))
}

/// Map an HTTP failure to an agent error class.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AgentError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::AuthFailed {
            provider: PROVIDER.to_string(),
        },
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            AgentError::Validation(format!("HTTP {status}: {snippet}"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => AgentError::Transient {
            provider: PROVIDER.to_string(),
            reason: format!("HTTP {status}"),
        },
        _ => AgentError::Unclassified(format!("HTTP {status}: {snippet}")),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ModelAgent for GeminiAgent {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn ask(&self, request: &AskRequest) -> Result<AgentReply, AgentError> {
        let body = build_request_body(request);
        let started = Instant::now();
        debug!(
            model = %request.model,
            files = request.file_refs.len(),
            history = request.history.len(),
            thinking_level = %request.thinking_level,
            "Calling Gemini"
        );

        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(self.config.request_timeout)
                } else {
                    AgentError::Transient {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, model = %request.model, "Gemini request failed");
            return Err(classify_status(status, retry_after, &text));
        }

        let json: Value = response.json().await.map_err(|e| AgentError::Transient {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;
        let (raw_text, usage) = extract_response(&json)?;
        let (assistant_text, actions, is_final) = parse_model_reply(&raw_text);
        let latency_ms = started.elapsed().as_millis() as u64;

        info!(
            model = %request.model,
            input_tokens = ?usage.input_tokens,
            output_tokens = ?usage.output_tokens,
            latency_ms,
            is_final,
            "Gemini reply received"
        );

        Ok(AgentReply {
            assistant_text,
            actions,
            is_final,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            latency_ms,
        })
    }
}
