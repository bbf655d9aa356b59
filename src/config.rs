//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Where workers take jobs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSourceKind {
    /// Consume the task queue.
    Queue,
    /// Poll the job table directly.
    Poll,
}

impl FromStr for JobSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "poll" => Ok(Self::Poll),
            other => Err(format!("expected 'queue' or 'poll', got '{other}'")),
        }
    }
}

/// Task queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Durable table in a libSQL file.
    LibSql,
    /// Process-local; tasks are lost on restart.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "libsql" => Ok(Self::LibSql),
            "memory" => Ok(Self::Memory),
            other => Err(format!("expected 'libsql' or 'memory', got '{other}'")),
        }
    }
}

/// Which parts of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Api,
    Worker,
}

impl Role {
    pub fn runs_api(&self) -> bool {
        matches!(self, Self::All | Self::Api)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "api" => Ok(Self::Api),
            "worker" => Ok(Self::Worker),
            other => Err(format!("expected 'all', 'api' or 'worker', got '{other}'")),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Job and conversation database file.
    pub db_path: PathBuf,
    pub job_source: JobSourceKind,
    pub queue_backend: QueueBackend,
    /// Queue database file (defaults to `db_path`).
    pub queue_path: PathBuf,
    /// How long a delivered task stays invisible before redelivery.
    pub queue_visibility: Duration,
    /// Number of concurrent workers.
    pub max_jobs: usize,
    /// Upper bound on one model call.
    pub job_timeout: Duration,
    pub max_retries: u32,
    /// Sleep between empty polls (poll source) and the reaper's base period.
    pub poll_interval: Duration,
    pub trace_capacity: usize,
    /// Earlier user/assistant pairs sent along with a question.
    pub history_pairs: usize,
    pub http_port: u16,
    pub role: Role,
    pub log_dir: PathBuf,
    pub gemini_api_key: Option<SecretString>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let job_timeout = Duration::from_secs(300);
        Self {
            db_path: PathBuf::from("./data/qa-jobs.db"),
            job_source: JobSourceKind::Queue,
            queue_backend: QueueBackend::LibSql,
            queue_path: PathBuf::from("./data/qa-jobs.db"),
            queue_visibility: job_timeout + Duration::from_secs(60),
            max_jobs: 10,
            job_timeout,
            max_retries: crate::jobs::model::DEFAULT_MAX_RETRIES,
            poll_interval: Duration::from_millis(1000),
            trace_capacity: crate::trace::DEFAULT_TRACE_CAPACITY,
            history_pairs: 5,
            http_port: 8000,
            role: Role::All,
            log_dir: PathBuf::from("./logs"),
            gemini_api_key: None,
        }
    }
}

impl PipelineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (environment-style keys).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = get("QA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let queue_path = get("QA_QUEUE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| db_path.clone());

        let job_timeout = Duration::from_secs(parse(&get, "QA_JOB_TIMEOUT_SECS", 300u64)?);
        if job_timeout.is_zero() {
            return Err(invalid("QA_JOB_TIMEOUT_SECS", "must be greater than zero"));
        }
        let queue_visibility = match get("QA_QUEUE_VISIBILITY_SECS") {
            Some(_) => Duration::from_secs(parse(&get, "QA_QUEUE_VISIBILITY_SECS", 0u64)?),
            None => job_timeout + Duration::from_secs(60),
        };

        let max_jobs: usize = parse(&get, "QA_MAX_JOBS", defaults.max_jobs)?;
        if max_jobs == 0 {
            return Err(invalid("QA_MAX_JOBS", "must be at least 1"));
        }

        Ok(Self {
            db_path,
            job_source: parse(&get, "QA_JOB_SOURCE", defaults.job_source)?,
            queue_backend: parse(&get, "QA_QUEUE_BACKEND", defaults.queue_backend)?,
            queue_path,
            queue_visibility,
            max_jobs,
            job_timeout,
            max_retries: parse(&get, "QA_MAX_RETRIES", defaults.max_retries)?,
            poll_interval: Duration::from_millis(parse(&get, "QA_POLL_INTERVAL_MS", 1000u64)?),
            trace_capacity: parse(&get, "QA_TRACE_CAPACITY", defaults.trace_capacity)?,
            history_pairs: parse(&get, "QA_HISTORY_PAIRS", defaults.history_pairs)?,
            http_port: parse(&get, "QA_HTTP_PORT", defaults.http_port)?,
            role: parse(&get, "QA_ROLE", defaults.role)?,
            log_dir: get("QA_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            gemini_api_key: get("GEMINI_API_KEY").map(SecretString::from),
        })
    }

    /// How often the stale-job reaper sweeps.
    pub fn reap_interval(&self) -> Duration {
        (self.poll_interval * 30).max(crate::worker::reaper::MIN_REAP_INTERVAL)
    }

    /// Age after which a `processing` claim counts as abandoned.
    pub fn stale_after(&self) -> Duration {
        self.job_timeout + crate::worker::reaper::DEFAULT_GRACE
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("./data/qa-jobs.db"));
        assert_eq!(cfg.queue_path, cfg.db_path);
        assert_eq!(cfg.job_source, JobSourceKind::Queue);
        assert_eq!(cfg.queue_backend, QueueBackend::LibSql);
        assert_eq!(cfg.max_jobs, 10);
        assert_eq!(cfg.job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.queue_visibility, Duration::from_secs(360));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.trace_capacity, 200);
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.role, Role::All);
        assert!(cfg.gemini_api_key.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("QA_DB_PATH", "/tmp/jobs.db"),
            ("QA_JOB_SOURCE", "poll"),
            ("QA_QUEUE_BACKEND", "Memory"),
            ("QA_MAX_JOBS", "4"),
            ("QA_JOB_TIMEOUT_SECS", "30"),
            ("QA_POLL_INTERVAL_MS", "250"),
            ("QA_ROLE", "worker"),
            ("GEMINI_API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(cfg.queue_path, PathBuf::from("/tmp/jobs.db"));
        assert_eq!(cfg.job_source, JobSourceKind::Poll);
        assert_eq!(cfg.queue_backend, QueueBackend::Memory);
        assert_eq!(cfg.max_jobs, 4);
        assert_eq!(cfg.queue_visibility, Duration::from_secs(90));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert!(cfg.role.runs_workers());
        assert!(!cfg.role.runs_api());
        assert!(cfg.gemini_api_key.is_some());
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = config(&[("QA_MAX_RETRIES", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "QA_MAX_RETRIES"));

        assert!(config(&[("QA_JOB_SOURCE", "kafka")]).is_err());
        assert!(config(&[("QA_MAX_JOBS", "0")]).is_err());
        assert!(config(&[("QA_JOB_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn reaper_timing() {
        let cfg = config(&[("QA_POLL_INTERVAL_MS", "10")]).unwrap();
        assert_eq!(cfg.reap_interval(), Duration::from_secs(5));
        let cfg = config(&[("QA_POLL_INTERVAL_MS", "1000")]).unwrap();
        assert_eq!(cfg.reap_interval(), Duration::from_secs(30));
        assert_eq!(cfg.stale_after(), Duration::from_secs(360));
    }
}
