//! The `LeadStore` trait: persistence for prospects, conversations,
//! transcripts, drafts, and the system config singleton.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SystemConfig;
use crate::error::DatabaseError;
use crate::leads::model::{
    Conversation, ConversationStatus, ConversationThread, IntentAssessment, Message, MessageRole,
    Outcome, PendingResponse, PendingReview, PendingStatus, Prospect,
};
use crate::prompts::PromptStore;

/// A draft to queue for approval.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDraft {
    pub content: String,
    pub provider: String,
    /// Outcome this draft closes the conversation with, if it is a closing.
    pub closes_with: Option<Outcome>,
}

/// Everything a new-lead notification changes, applied atomically.
#[derive(Debug, Clone)]
pub struct LeadCommit {
    pub email: String,
    pub first_name: String,
    pub phone: Option<String>,
    pub thread_subject: String,
    pub opening: NewDraft,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeadCommitResult {
    pub prospect: Prospect,
    pub conversation: Conversation,
    pub pending: PendingResponse,
    /// The (prospect, subject) thread did not exist before.
    pub created: bool,
    /// The thread existed but was cold or complete.
    pub reopened: bool,
}

/// Everything one inbound reply changes, applied atomically.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub conversation_id: Uuid,
    pub inbound: String,
    pub at: DateTime<Utc>,
    /// Sets the outcome. `None` keeps a decided outcome on an active
    /// thread and clears it on a reopened one.
    pub outcome: Option<Outcome>,
    /// Replaces the stored intent only when `Some`.
    pub intent: Option<IntentAssessment>,
    pub lead_score: Option<f64>,
    pub draft: Option<NewDraft>,
}

#[derive(Debug, Clone)]
pub struct TurnCommitResult {
    pub conversation: Conversation,
    pub pending: Option<PendingResponse>,
    pub reopened: bool,
    /// Open drafts retired because a newer one replaced them.
    pub superseded: u64,
}

/// Async persistence backend for the lead pipeline.
#[async_trait]
pub trait LeadStore: PromptStore + Send + Sync {
    /// Run migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── System config ───────────────────────────────────────────────

    /// Read the singleton, creating the default row on first access.
    async fn load_system_config(&self) -> Result<SystemConfig, DatabaseError>;

    /// Overwrite the singleton. Invalid configs are rejected.
    async fn save_system_config(&self, config: &SystemConfig) -> Result<(), DatabaseError>;

    // ── Prospects & conversations ───────────────────────────────────

    async fn get_prospect(&self, id: Uuid) -> Result<Option<Prospect>, DatabaseError>;

    async fn find_prospect_by_email(&self, email: &str) -> Result<Option<Prospect>, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    async fn find_conversation(
        &self,
        prospect_id: Uuid,
        thread_subject: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Threads in any of the given states, with their prospect.
    async fn list_threads(
        &self,
        statuses: &[ConversationStatus],
    ) -> Result<Vec<(Prospect, Conversation)>, DatabaseError>;

    /// Prospect, conversation, and ordered transcript. Missing ids are `NotFound`.
    async fn load_thread(&self, conversation_id: Uuid) -> Result<ConversationThread, DatabaseError>;

    /// Transcript ordered by creation time.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message, DatabaseError>;

    async fn last_message_role(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<MessageRole>, DatabaseError>;

    /// Active conversations whose last activity is strictly before `cutoff`.
    async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    /// Move an active conversation to cold. Returns false if it was not active.
    async fn mark_cold(&self, conversation_id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    async fn get_pending(&self, id: Uuid) -> Result<Option<PendingResponse>, DatabaseError>;

    async fn open_pending_for(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<PendingResponse>, DatabaseError>;

    /// Open drafts with review context, oldest first.
    async fn list_open_pending(&self) -> Result<Vec<PendingReview>, DatabaseError>;

    /// Action a draft that is still pending. Returns false if it was not.
    async fn action_pending(
        &self,
        id: Uuid,
        status: PendingStatus,
        edited_content: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record delivery: stamp `sent_at`, append a `sent` transcript entry
    /// with the final content, and complete the conversation when the draft
    /// is a closing (`closes_with` set).
    async fn record_sent(&self, pending_id: Uuid, at: DateTime<Utc>) -> Result<Message, DatabaseError>;

    // ── Atomic units ────────────────────────────────────────────────

    async fn commit_new_lead(&self, commit: LeadCommit) -> Result<LeadCommitResult, DatabaseError>;

    async fn commit_turn(&self, commit: TurnCommit) -> Result<TurnCommitResult, DatabaseError>;
}
