//! Persistence layer: libSQL-backed storage for leads, drafts, and prompts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{LeadCommit, LeadCommitResult, LeadStore, NewDraft, TurnCommit, TurnCommitResult};
