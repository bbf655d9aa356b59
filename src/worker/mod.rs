//! Worker system — pulls deliveries and drives jobs through their states.
//!
//! - `source` — where deliveries come from (`PollSource`, `QueueSource`)
//! - `dispatcher` — per-delivery processing and retry resolution
//! - `group` — the pool of worker loops with graceful shutdown
//! - `reaper` — recovery of jobs abandoned in `processing`

pub mod dispatcher;
pub mod group;
pub mod reaper;
pub mod source;

pub use dispatcher::{Dispatcher, DispatcherConfig, Outcome};
pub use group::WorkerGroup;
pub use reaper::StaleJobReaper;
pub use source::{Delivery, JobSource, PollSource, QueueSource};
