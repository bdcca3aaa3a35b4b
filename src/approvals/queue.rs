//! Approval queue: the human gate between drafts and sent mail.
//!
//! Backed by the store, so drafts survive restarts. Only `pending` drafts
//! can be approved or rejected, and only approved drafts can be sent.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::leads::model::{Message, PendingResponse, PendingReview, PendingStatus};
use crate::store::LeadStore;

pub struct ApprovalQueue {
    store: Arc<dyn LeadStore>,
}

impl ApprovalQueue {
    pub fn new(store: Arc<dyn LeadStore>) -> Self {
        Self { store }
    }

    /// Open drafts with review context, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingReview>, ApprovalError> {
        Ok(self.store.list_open_pending().await?)
    }

    /// Approve a draft, optionally with a human edit.
    ///
    /// An edit that matches the draft after trimming counts as a plain
    /// approval. A blank edit is refused.
    pub async fn approve(
        &self,
        id: Uuid,
        edited: Option<String>,
    ) -> Result<PendingResponse, ApprovalError> {
        let pending = self.open_draft(id, "approve").await?;

        let edit = match edited {
            Some(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(ApprovalError::EmptyEdit { id });
                }
                (text != pending.llm_content.trim()).then(|| text.to_string())
            }
            None => None,
        };
        let status = if edit.is_some() {
            PendingStatus::Edited
        } else {
            PendingStatus::Approved
        };

        self.transition(&pending, status, edit.as_deref(), "approve").await
    }

    pub async fn reject(&self, id: Uuid) -> Result<PendingResponse, ApprovalError> {
        let pending = self.open_draft(id, "reject").await?;
        self.transition(&pending, PendingStatus::Rejected, None, "reject").await
    }

    /// Record that an approved draft went out. Closing drafts (those
    /// carrying `closes_with`) complete the conversation.
    pub async fn mark_sent(&self, id: Uuid) -> Result<Message, ApprovalError> {
        let pending = self.get(id).await?;
        let sendable = matches!(pending.status, PendingStatus::Approved | PendingStatus::Edited);
        if !sendable || pending.sent_at.is_some() {
            let status = if pending.sent_at.is_some() {
                "sent".to_string()
            } else {
                pending.status.to_string()
            };
            return Err(ApprovalError::NotPending {
                id,
                status,
                action: "send".into(),
            });
        }

        let message = self.store.record_sent(id, Utc::now()).await?;
        info!(
            pending_id = %id,
            conversation_id = %pending.conversation_id,
            closes_with = ?pending.closes_with,
            "Draft sent"
        );
        Ok(message)
    }

    async fn get(&self, id: Uuid) -> Result<PendingResponse, ApprovalError> {
        self.store
            .get_pending(id)
            .await?
            .ok_or(ApprovalError::NotFound { id })
    }

    async fn open_draft(&self, id: Uuid, action: &str) -> Result<PendingResponse, ApprovalError> {
        let pending = self.get(id).await?;
        if !pending.is_open() {
            warn!(pending_id = %id, status = %pending.status, action, "Draft is not pending");
            return Err(ApprovalError::NotPending {
                id,
                status: pending.status.to_string(),
                action: action.to_string(),
            });
        }
        Ok(pending)
    }

    async fn transition(
        &self,
        pending: &PendingResponse,
        status: PendingStatus,
        edited: Option<&str>,
        action: &str,
    ) -> Result<PendingResponse, ApprovalError> {
        let id = pending.id;
        // Conditional update: loses cleanly to a concurrent reviewer.
        if !self.store.action_pending(id, status, edited, Utc::now()).await? {
            let current = self.get(id).await?;
            return Err(ApprovalError::NotPending {
                id,
                status: current.status.to_string(),
                action: action.to_string(),
            });
        }
        info!(pending_id = %id, status = %status, "Draft actioned");
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::model::{ConversationStatus, MessageRole, Outcome};
    use crate::store::{LeadCommit, LibSqlBackend, NewDraft, TurnCommit};

    async fn setup() -> (Arc<LibSqlBackend>, ApprovalQueue, Uuid, Uuid) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db
            .commit_new_lead(LeadCommit {
                email: "jo@example.com".into(),
                first_name: "Jo".into(),
                phone: None,
                thread_subject: "New Prospect Notification".into(),
                opening: NewDraft {
                    content: "Hi Jo!".into(),
                    provider: "template".into(),
                    closes_with: None,
                },
                at: Utc::now(),
            })
            .await
            .unwrap();
        let queue = ApprovalQueue::new(db.clone());
        (db, queue, lead.pending.id, lead.conversation.id)
    }

    #[tokio::test]
    async fn approve_without_edit() {
        let (_db, queue, id, _) = setup().await;
        assert_eq!(queue.pending().await.unwrap().len(), 1);

        let approved = queue.approve(id, None).await.unwrap();
        assert_eq!(approved.status, PendingStatus::Approved);
        assert!(approved.edited_content.is_none());
        assert!(approved.actioned_at.is_some());
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unchanged_edit_is_plain_approval() {
        let (_db, queue, id, _) = setup().await;
        let approved = queue.approve(id, Some("  Hi Jo!\n".into())).await.unwrap();
        assert_eq!(approved.status, PendingStatus::Approved);
        assert_eq!(approved.final_content(), "Hi Jo!");
    }

    #[tokio::test]
    async fn real_edit_is_recorded() {
        let (_db, queue, id, _) = setup().await;
        let edited = queue.approve(id, Some(" Hey Jo! ".into())).await.unwrap();
        assert_eq!(edited.status, PendingStatus::Edited);
        assert_eq!(edited.llm_content, "Hi Jo!");
        assert_eq!(edited.final_content(), "Hey Jo!");
    }

    #[tokio::test]
    async fn blank_edit_refused() {
        let (_db, queue, id, _) = setup().await;
        let err = queue.approve(id, Some("   ".into())).await.unwrap_err();
        assert!(matches!(err, ApprovalError::EmptyEdit { .. }));
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_pending_drafts_can_be_actioned() {
        let (_db, queue, id, _) = setup().await;
        queue.reject(id).await.unwrap();

        let err = queue.approve(id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::NotPending { ref status, .. } if status == "rejected"
        ));
        assert!(matches!(queue.reject(id).await, Err(ApprovalError::NotPending { .. })));
    }

    #[tokio::test]
    async fn unknown_id_not_found() {
        let (_db, queue, _, _) = setup().await;
        let missing = Uuid::new_v4();
        assert!(matches!(queue.approve(missing, None).await, Err(ApprovalError::NotFound { .. })));
        assert!(matches!(queue.reject(missing).await, Err(ApprovalError::NotFound { .. })));
        assert!(matches!(queue.mark_sent(missing).await, Err(ApprovalError::NotFound { .. })));
    }

    #[tokio::test]
    async fn mark_sent_logs_final_content_once() {
        let (db, queue, id, conversation_id) = setup().await;
        assert!(matches!(queue.mark_sent(id).await, Err(ApprovalError::NotPending { .. })));

        queue.approve(id, Some("Hey Jo!".into())).await.unwrap();
        let sent = queue.mark_sent(id).await.unwrap();
        assert_eq!(sent.role, MessageRole::Sent);
        assert_eq!(sent.content, "Hey Jo!");

        let err = queue.mark_sent(id).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending { ref status, .. } if status == "sent"));

        let c = db.get_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(c.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn sending_closing_draft_completes_conversation() {
        let (db, queue, id, conversation_id) = setup().await;
        queue.approve(id, None).await.unwrap();
        queue.mark_sent(id).await.unwrap();

        let turn = db
            .commit_turn(TurnCommit {
                conversation_id,
                inbound: "Tuesday at 6pm works".into(),
                at: Utc::now(),
                outcome: Some(Outcome::AgreedToFreeClass),
                intent: None,
                lead_score: None,
                draft: Some(NewDraft {
                    content: "See you Tuesday!".into(),
                    provider: "grok".into(),
                    closes_with: Some(Outcome::AgreedToFreeClass),
                }),
            })
            .await
            .unwrap();
        let closing = turn.pending.unwrap().id;

        queue.approve(closing, None).await.unwrap();
        queue.mark_sent(closing).await.unwrap();

        let c = db.get_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(c.status, ConversationStatus::Complete);
        assert_eq!(c.outcome, Some(Outcome::AgreedToFreeClass));
    }
}
