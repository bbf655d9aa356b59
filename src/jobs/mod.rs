//! Jobs — the record, its retry policy, change notifications, and the
//! service facade used by the API.

pub mod events;
pub mod model;
pub mod retry;
pub mod service;

pub use events::{JobEvent, JobEventFilter, JobEvents};
pub use model::{
    FileRef, Job, JobFilter, JobRequest, JobResult, JobStatus, ModelAction, NewJob, StatusUpdate,
    ThinkingLevel,
};
pub use retry::{FailReason, RetryDecision, RetryPolicy};
pub use service::{JobService, Submission};
