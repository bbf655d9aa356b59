//! QA Jobs — asynchronous question answering over documents.
//!
//! Questions are recorded as jobs, handed to workers through a task queue
//! (or picked up by polling the job table), answered by a model agent and
//! written back to the conversation exactly once.

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod store;
pub mod trace;
pub mod worker;
