//! Lead processor: turns inbound leads and replies into queued drafts.
//!
//! **Core invariant: nothing is sent without human approval.**
//! Every outbound message is a draft in the approval queue first; the only
//! send path is `approve`.
//!
//! Flow per inbound reply:
//! 1. Load the thread and system config
//! 2. Engine decides (limit check, classifier, turn or closing)
//! 3. Score the updated thread
//! 4. Commit inbound message, outcome, intent, score and draft atomically
//! 5. Notify when the score crosses the hot threshold

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::approvals::ApprovalQueue;
use crate::channels::email_types::reply_subject;
use crate::channels::transport::{HotLeadNotifier, LeadTransport, NewLead, OpenThread, ProspectReply};
use crate::error::{PipelineError, TransportError};
use crate::leads::engine::ConversationEngine;
use crate::leads::model::{
    Conversation, ConversationStatus, Message, PendingResponse, PendingReview, PendingStatus,
    Prospect,
};
use crate::leads::scoring::{LeadScore, ScoringEngine};
use crate::leads::sweep;
use crate::store::{LeadCommit, LeadStore, NewDraft, TurnCommit};

/// Something that arrived from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewLead(NewLead),
    Reply(ProspectReply),
}

/// What processing one inbound event changed.
#[derive(Debug, Clone)]
pub struct ProcessedInbound {
    pub conversation: Conversation,
    /// The draft queued for review. `None` for duplicate notifications.
    pub pending: Option<PendingResponse>,
    /// Present for replies; new leads are not scored until they answer.
    pub score: Option<LeadScore>,
}

/// Counts for one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub leads: usize,
    pub replies: usize,
    pub processed: usize,
    pub failed: usize,
}

pub struct LeadProcessor {
    store: Arc<dyn LeadStore>,
    engine: ConversationEngine,
    scoring: ScoringEngine,
    notifier: Arc<dyn HotLeadNotifier>,
    outbound: Arc<dyn LeadTransport>,
    queue: ApprovalQueue,
}

impl LeadProcessor {
    /// `outbound` carries approved drafts; it is usually the same
    /// transport the poller reads from.
    pub fn new(
        store: Arc<dyn LeadStore>,
        engine: ConversationEngine,
        scoring: ScoringEngine,
        notifier: Arc<dyn HotLeadNotifier>,
        outbound: Arc<dyn LeadTransport>,
    ) -> Self {
        let queue = ApprovalQueue::new(Arc::clone(&store));
        Self {
            store,
            engine,
            scoring,
            notifier,
            outbound,
            queue,
        }
    }

    pub fn store(&self) -> &Arc<dyn LeadStore> {
        &self.store
    }

    pub fn queue(&self) -> &ApprovalQueue {
        &self.queue
    }

    /// Process one lead or reply as a single atomic update.
    pub async fn process_inbound(&self, event: InboundEvent) -> Result<ProcessedInbound, PipelineError> {
        match event {
            InboundEvent::NewLead(lead) => self.handle_new_lead(lead).await,
            InboundEvent::Reply(reply) => self.handle_reply(reply).await,
        }
    }

    /// One polling pass: new leads first, then replies on open threads.
    ///
    /// A failing item is logged and counted; it never stops the pass. A
    /// failing lead fetch is returned as an error, since nothing was
    /// processed. A failing reply fetch is logged and the lead counts are
    /// still returned.
    pub async fn poll_once(&self, transport: &dyn LeadTransport) -> Result<PollSummary, PipelineError> {
        let mut summary = PollSummary::default();

        let leads = transport.fetch_new_leads().await?;
        summary.leads = leads.len();
        for lead in leads {
            let email = lead.email.clone();
            match self.handle_new_lead(lead).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    error!(email = %email, error = %e, "Failed to process new lead");
                    summary.failed += 1;
                }
            }
        }

        // Leads above are already committed; a failed reply fetch only
        // skips the second half of the pass.
        let open = self.open_threads().await?;
        let replies = if open.is_empty() {
            Vec::new()
        } else {
            match transport.fetch_replies(&open).await {
                Ok(replies) => replies,
                Err(e) => {
                    error!(transport = transport.name(), error = %e, "Failed to fetch replies");
                    Vec::new()
                }
            }
        };
        summary.replies = replies.len();
        for reply in replies {
            let email = reply.prospect_email.clone();
            match self.handle_reply(reply).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    error!(email = %email, error = %e, "Failed to process reply");
                    summary.failed += 1;
                }
            }
        }

        if summary.leads + summary.replies > 0 {
            info!(
                transport = transport.name(),
                leads = summary.leads,
                replies = summary.replies,
                processed = summary.processed,
                failed = summary.failed,
                "Poll pass complete"
            );
        } else {
            debug!(transport = transport.name(), "Poll pass found nothing");
        }
        Ok(summary)
    }

    /// Score a stored conversation. Read-only.
    pub async fn score(&self, conversation_id: Uuid) -> Result<LeadScore, PipelineError> {
        let thread = self.store.load_thread(conversation_id).await?;
        Ok(self.scoring.score(&thread))
    }

    pub async fn sweep_cold(&self) -> Result<Vec<Conversation>, PipelineError> {
        Ok(sweep::sweep_cold(self.store.as_ref(), Utc::now()).await?)
    }

    pub async fn pending(&self) -> Result<Vec<PendingReview>, PipelineError> {
        Ok(self.queue.pending().await?)
    }

    /// Approve a draft, send it, and log it as sent.
    ///
    /// A send failure leaves the draft approved but unsent, so the caller
    /// sees the error and the transcript does not claim delivery. Calling
    /// again without an edit retries the send.
    pub async fn approve(
        &self,
        pending_id: Uuid,
        edited: Option<String>,
    ) -> Result<Message, PipelineError> {
        let unsent = self
            .store
            .get_pending(pending_id)
            .await?
            .filter(|p| matches!(p.status, PendingStatus::Approved | PendingStatus::Edited))
            .filter(|p| p.sent_at.is_none());
        let pending = match unsent {
            Some(p) if edited.is_none() => {
                info!(pending_id = %pending_id, "Retrying send of approved draft");
                p
            }
            _ => self.queue.approve(pending_id, edited).await?,
        };
        let thread = self.store.load_thread(pending.conversation_id).await?;

        let subject = reply_subject(&thread.conversation.thread_subject);
        self.outbound
            .send(&thread.prospect.email, &subject, pending.final_content())
            .await?;

        Ok(self.queue.mark_sent(pending_id).await?)
    }

    pub async fn reject(&self, pending_id: Uuid) -> Result<PendingResponse, PipelineError> {
        Ok(self.queue.reject(pending_id).await?)
    }

    async fn open_threads(&self) -> Result<Vec<OpenThread>, PipelineError> {
        // Cold and complete threads are watched too: a reply reopens them.
        let threads = self
            .store
            .list_threads(&[
                ConversationStatus::Active,
                ConversationStatus::Cold,
                ConversationStatus::Complete,
            ])
            .await?;
        Ok(threads
            .into_iter()
            .map(|(prospect, conversation)| OpenThread {
                conversation_id: conversation.id,
                prospect_email: prospect.email,
                thread_subject: conversation.thread_subject,
            })
            .collect())
    }

    async fn handle_new_lead(&self, lead: NewLead) -> Result<ProcessedInbound, PipelineError> {
        if let Some(existing) = self.active_thread(&lead.email, &lead.thread_subject).await? {
            debug!(
                conversation_id = %existing.id,
                email = %lead.email,
                "Duplicate lead notification ignored"
            );
            return Ok(ProcessedInbound {
                conversation: existing,
                pending: None,
                score: None,
            });
        }

        let opening = self.engine.generate_opening(&lead.first_name);
        let committed = self
            .store
            .commit_new_lead(LeadCommit {
                email: lead.email,
                first_name: lead.first_name,
                phone: lead.phone,
                thread_subject: lead.thread_subject,
                opening: NewDraft {
                    content: opening.reply,
                    provider: opening.provider,
                    closes_with: None,
                },
                at: lead.received_at.min(Utc::now()),
            })
            .await?;

        info!(
            conversation_id = %committed.conversation.id,
            email = %committed.prospect.email,
            created = committed.created,
            reopened = committed.reopened,
            "New lead queued for opening"
        );
        Ok(ProcessedInbound {
            conversation: committed.conversation,
            pending: Some(committed.pending),
            score: None,
        })
    }

    async fn handle_reply(&self, reply: ProspectReply) -> Result<ProcessedInbound, PipelineError> {
        let text = reply.reply_text.trim();
        if text.is_empty() {
            return Err(TransportError::InvalidMessage(format!(
                "empty reply from {}",
                reply.prospect_email
            ))
            .into());
        }

        let unknown = || PipelineError::UnknownThread {
            email: reply.prospect_email.clone(),
            subject: reply.thread_subject.clone(),
        };
        let prospect = self
            .store
            .find_prospect_by_email(&reply.prospect_email)
            .await?
            .ok_or_else(unknown)?;
        let conversation = self
            .store
            .find_conversation(prospect.id, &reply.thread_subject)
            .await?
            .ok_or_else(unknown)?;

        let history = self.store.load_thread(conversation.id).await?;
        let config = self.store.load_system_config().await?;
        let at = inbound_timestamp(reply.received_at, &history.conversation, Utc::now());

        let draft = self
            .engine
            .respond(&history, text, at, config.max_message_exchanges)
            .await?;

        // Score the thread as it will look once committed.
        let mut after = history.clone().with_inbound(text, at);
        after.conversation.outcome = draft.outcome;
        if let Some(intent) = &draft.intent {
            after.conversation.intent = Some(intent.clone());
        }
        let score = self.scoring.score(&after);

        let committed = self
            .store
            .commit_turn(TurnCommit {
                conversation_id: conversation.id,
                inbound: text.to_string(),
                at,
                outcome: draft.outcome,
                intent: draft.intent,
                lead_score: Some(score.score),
                draft: Some(NewDraft {
                    content: draft.text,
                    provider: draft.provider,
                    closes_with: draft.outcome,
                }),
            })
            .await?;

        info!(
            conversation_id = %conversation.id,
            outcome = ?committed.conversation.outcome,
            score = score.score,
            reopened = committed.reopened,
            superseded = committed.superseded,
            "Reply processed"
        );

        if crossed_hot(history.conversation.lead_score, score.score, self.scoring.config().hot_threshold) {
            self.notify(&committed.conversation, &history.prospect, &score).await;
        }

        Ok(ProcessedInbound {
            conversation: committed.conversation,
            pending: committed.pending,
            score: Some(score),
        })
    }

    async fn active_thread(&self, email: &str, subject: &str) -> Result<Option<Conversation>, PipelineError> {
        let Some(prospect) = self.store.find_prospect_by_email(email).await? else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_conversation(prospect.id, subject)
            .await?
            .filter(|c| c.status == ConversationStatus::Active))
    }

    async fn notify(&self, conversation: &Conversation, prospect: &Prospect, score: &LeadScore) {
        match self.notifier.notify_hot_lead(conversation, prospect, score).await {
            Ok(()) => info!(conversation_id = %conversation.id, score = score.score, "Hot lead notified"),
            Err(e) => warn!(conversation_id = %conversation.id, error = %e, "Hot-lead notification failed"),
        }
    }
}

/// Clamp a transport timestamp so the transcript stays ordered: never in
/// the future, never before the thread's last activity.
fn inbound_timestamp(
    received_at: DateTime<Utc>,
    conversation: &Conversation,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    received_at.min(now).max(conversation.last_message_at)
}

/// True only on the transition from below the threshold to at or above it.
fn crossed_hot(previous: Option<f64>, current: f64, threshold: f64) -> bool {
    current >= threshold && previous.is_none_or(|p| p < threshold)
}
