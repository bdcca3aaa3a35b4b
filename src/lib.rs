//! Lead qualifier: email conversations with gym leads, drafted by a
//! language model and sent only after human approval.

pub mod approvals;
pub mod channels;
pub mod config;
pub mod error;
pub mod leads;
pub mod llm;
pub mod prompts;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
