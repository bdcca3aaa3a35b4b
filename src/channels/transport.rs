//! Transport and notifier traits the lead pipeline talks through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::TransportError;
use crate::leads::model::{Conversation, Prospect};
use crate::leads::scoring::LeadScore;

/// A lead pulled from a web-form notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub email: String,
    pub first_name: String,
    pub phone: Option<String>,
    pub thread_subject: String,
    /// Gym location named in the notification, if any.
    pub location: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A thread the transport should watch for replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenThread {
    pub conversation_id: Uuid,
    pub prospect_email: String,
    pub thread_subject: String,
}

/// A prospect's reply, already cleaned of quoted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspectReply {
    /// Subject of the stored thread this reply belongs to.
    pub thread_subject: String,
    pub prospect_email: String,
    pub reply_text: String,
    pub received_at: DateTime<Utc>,
}

/// Where leads and replies come from and where approved drafts go.
#[async_trait]
pub trait LeadTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_new_leads(&self) -> Result<Vec<NewLead>, TransportError>;

    async fn fetch_replies(&self, open: &[OpenThread]) -> Result<Vec<ProspectReply>, TransportError>;

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

/// Told when a conversation becomes a hot lead.
#[async_trait]
pub trait HotLeadNotifier: Send + Sync {
    async fn notify_hot_lead(
        &self,
        conversation: &Conversation,
        prospect: &Prospect,
        score: &LeadScore,
    ) -> Result<(), TransportError>;
}

/// Subject and body of a hot-lead alert.
pub fn hot_lead_summary(
    conversation: &Conversation,
    prospect: &Prospect,
    score: &LeadScore,
) -> (String, String) {
    let subject = format!(
        "Hot lead: {} ({:.0}%)",
        prospect.first_name,
        score.score * 100.0
    );

    let mut body = format!(
        "{} <{}> is a hot lead.\n\nScore: {:.2}\nPhone: {}\nThread: {}\n",
        prospect.first_name,
        prospect.email,
        score.score,
        prospect.phone.as_deref().unwrap_or("not provided"),
        conversation.thread_subject,
    );
    if let Some(intent) = &conversation.intent {
        body.push_str(&format!("Goal: {}\n", intent.primary_intent));
        if let Some(time) = &intent.best_time_to_visit {
            body.push_str(&format!("Best time to visit: {time}\n"));
        }
    }
    if !score.factors.is_empty() {
        body.push_str("\nWhy:\n");
        for factor in &score.factors {
            body.push_str(&format!("- {factor}\n"));
        }
    }
    if !score.recommendations.is_empty() {
        body.push_str("\nNext steps:\n");
        for rec in &score.recommendations {
            body.push_str(&format!("- {rec}\n"));
        }
    }
    (subject, body)
}

/// Logs hot leads instead of delivering them anywhere.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl HotLeadNotifier for LogNotifier {
    async fn notify_hot_lead(
        &self,
        conversation: &Conversation,
        prospect: &Prospect,
        score: &LeadScore,
    ) -> Result<(), TransportError> {
        info!(
            conversation_id = %conversation.id,
            email = %prospect.email,
            score = score.score,
            reason = %score.reason,
            "Hot lead"
        );
        Ok(())
    }
}
