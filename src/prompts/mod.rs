//! Versioned prompt templates.
//!
//! Each named prompt has an append-only list of versions and a pointer to
//! the active one. Activating a version swaps the pointer; stored content is
//! never rewritten.

mod defaults;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DatabaseError;
use crate::leads::model::Outcome;

pub use defaults::DEFAULT_PROMPTS;

pub const SALES_SYSTEM_PROMPT: &str = "Sales System Prompt";
pub const ASSESSMENT_PROMPT: &str = "Conversation Assessment Prompt";
pub const CLOSING_PROMPT: &str = "Closing Message Prompt";

/// One immutable revision of a named prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub prompt_name: String,
    pub version: i64,
    pub content: String,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage for named, versioned prompts.
#[async_trait]
pub trait PromptStore: Send + Sync {
    /// Content of the active version. Missing prompts are `NotFound`.
    async fn get_active_content(&self, name: &str) -> Result<String, DatabaseError>;

    /// Append a new version (n+1). Does not change which version is active.
    async fn create_version(
        &self,
        name: &str,
        content: &str,
        notes: Option<&str>,
    ) -> Result<PromptVersion, DatabaseError>;

    /// Point the prompt at an existing version.
    async fn activate_version(&self, name: &str, version: i64) -> Result<(), DatabaseError>;

    /// All versions, oldest first.
    async fn list_versions(&self, name: &str) -> Result<Vec<PromptVersion>, DatabaseError>;
}

/// Install version 1 of every default prompt that has no versions yet.
///
/// Returns how many prompts were created.
pub async fn seed_default_prompts(store: &dyn PromptStore) -> Result<usize, DatabaseError> {
    let mut created = 0;
    for &(name, content, notes) in DEFAULT_PROMPTS {
        if !store.list_versions(name).await?.is_empty() {
            continue;
        }
        let version = store.create_version(name, content, Some(notes)).await?;
        store.activate_version(name, version.version).await?;
        info!(prompt = name, version = version.version, "Seeded default prompt");
        created += 1;
    }
    Ok(created)
}

/// Closing-message templates keyed by outcome.
#[derive(Debug, Clone)]
pub struct ClosingPrompts {
    by_outcome: HashMap<String, String>,
}

impl ClosingPrompts {
    pub fn parse(content: &str) -> Result<Self, DatabaseError> {
        let by_outcome: HashMap<String, String> = serde_json::from_str(content).map_err(|e| {
            DatabaseError::Serialization(format!("{CLOSING_PROMPT} is not a JSON map: {e}"))
        })?;
        if !by_outcome.contains_key(Outcome::ReachedMessageLimit.as_str()) {
            return Err(DatabaseError::Serialization(format!(
                "{CLOSING_PROMPT} has no '{}' entry",
                Outcome::ReachedMessageLimit
            )));
        }
        Ok(Self { by_outcome })
    }

    /// Template for an outcome with `{name}` filled in. Outcomes without
    /// their own entry use the message-limit template.
    pub fn render(&self, outcome: Outcome, first_name: &str) -> String {
        let template = self
            .by_outcome
            .get(outcome.as_str())
            .or_else(|| self.by_outcome.get(Outcome::ReachedMessageLimit.as_str()))
            .map(String::as_str)
            .unwrap_or_default();
        template.replace("{name}", first_name)
    }
}

/// Fill the assessment template's placeholders.
pub fn render_assessment(template: &str, history: &str, latest: &str) -> String {
    template
        .replace("{conversation_history}", history)
        .replace("{prospect_response}", latest)
}
