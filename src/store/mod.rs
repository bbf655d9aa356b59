//! Persistence layer — libSQL-backed storage for jobs, messages, and
//! conversations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ConversationMessage, ConversationStore, JobStore, MessageRole, MessageStore, NewMessage, Store,
};
