//! Retry policy: classifies failures and decides backoff.

use std::time::Duration;

use rand::Rng;

use crate::error::AgentError;
use crate::jobs::model::Job;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Requeue with the new retry count after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Mark the job failed; do not requeue.
    Fail { reason: FailReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The error class can never succeed on retry.
    NonRetryable,
    /// `retry_count` reached `max_retries`.
    Exhausted,
}

/// Retry policy for failed model calls.
///
/// Backoff is exponential: `base_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`, plus up to `jitter` of random spread.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Decide the next step for `job` after `error`.
    ///
    /// The ceiling is inclusive: a job may be retried `max_retries` times,
    /// i.e. run `max_retries + 1` attempts in total.
    pub fn decide(&self, job: &Job, error: &AgentError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Fail {
                reason: FailReason::NonRetryable,
            };
        }
        if job.retries_exhausted() {
            return RetryDecision::Fail {
                reason: FailReason::Exhausted,
            };
        }

        let retry_count = job.retry_count + 1;
        let mut delay = self.with_jitter(self.backoff(retry_count));
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint);
        }
        RetryDecision::Retry { retry_count, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobRequest, JobStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn job_with(retry_count: u32, max_retries: u32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            client_id: "default".into(),
            status: JobStatus::Processing,
            request: JobRequest::new("q", "test-model"),
            retry_count,
            max_retries,
            result: None,
            error_message: None,
            available_at: now,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
        }
    }

    fn transient() -> AgentError {
        AgentError::Transient {
            provider: "stub".into(),
            reason: "503".into(),
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let RetryDecision::Retry { delay, .. } = policy.decide(&job_with(0, 3), &transient())
            else {
                panic!("expected retry");
            };
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs_f64(2.4));
        }
    }

    #[test]
    fn retryable_error_below_ceiling_retries() {
        let policy = RetryPolicy::immediate();
        let decision = policy.decide(&job_with(2, 3), &transient());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 3,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn ceiling_is_inclusive() {
        let policy = RetryPolicy::immediate();
        assert_eq!(
            policy.decide(&job_with(3, 3), &transient()),
            RetryDecision::Fail {
                reason: FailReason::Exhausted
            }
        );
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let policy = RetryPolicy::immediate();
        assert!(matches!(
            policy.decide(&job_with(0, 0), &AgentError::Timeout(Duration::from_secs(1))),
            RetryDecision::Fail { .. }
        ));
    }

    #[test]
    fn validation_error_short_circuits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(
            policy.decide(&job_with(0, 3), &AgentError::Validation("bad".into())),
            RetryDecision::Fail {
                reason: FailReason::NonRetryable
            }
        );
    }

    #[test]
    fn rate_limit_hint_raises_delay() {
        let policy = RetryPolicy::immediate();
        let err = AgentError::RateLimited {
            provider: "stub".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        let RetryDecision::Retry { delay, .. } = policy.decide(&job_with(0, 3), &err) else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(30));
    }
}
