//! Lead data model: prospects, conversation threads, messages, and drafts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A person who submitted interest in the gym. Unique by email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prospect {
    pub fn has_phone(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

/// Lifecycle state of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Still being worked.
    Active,
    /// Prospect went quiet after our last message.
    Cold,
    /// Closing message sent.
    Complete,
}

impl ConversationStatus {
    /// Cold and complete threads only come back through a reopen.
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cold => write!(f, "cold"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cold" => Ok(Self::Cold),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("Unknown conversation status: {s}")),
        }
    }
}

/// Terminal classification of a conversation. `None` on a conversation
/// means "continue".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    AgreedToFreeClass,
    NotInterested,
    ReachedMessageLimit,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgreedToFreeClass => "agreed_to_free_class",
            Self::NotInterested => "not_interested",
            Self::ReachedMessageLimit => "reached_message_limit",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agreed_to_free_class" => Ok(Self::AgreedToFreeClass),
            "not_interested" => Ok(Self::NotInterested),
            "reached_message_limit" => Ok(Self::ReachedMessageLimit),
            _ => Err(format!("Unknown outcome: {s}")),
        }
    }
}

/// The prospect's primary fitness goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    WeightLoss,
    StressReliefMentalHealth,
    LearnBoxingTechnique,
    GeneralFitness,
    SocialCommunity,
    JustWantsFreeClass,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Self::WeightLoss,
        Self::StressReliefMentalHealth,
        Self::LearnBoxingTechnique,
        Self::GeneralFitness,
        Self::SocialCommunity,
        Self::JustWantsFreeClass,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightLoss => "weight_loss",
            Self::StressReliefMentalHealth => "stress_relief_mental_health",
            Self::LearnBoxingTechnique => "learn_boxing_technique",
            Self::GeneralFitness => "general_fitness",
            Self::SocialCommunity => "social_community",
            Self::JustWantsFreeClass => "just_wants_free_class",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured intent emitted alongside a generated turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAssessment {
    pub primary_intent: Intent,
    /// Model confidence, always within 0..=1.
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub best_time_to_visit: Option<String>,
}

impl IntentAssessment {
    pub fn new(primary_intent: Intent, confidence: f64) -> Self {
        Self {
            primary_intent,
            confidence: clamp_unit(confidence),
            reasoning: None,
            best_time_to_visit: None,
        }
    }

    pub fn with_best_time(mut self, best_time: impl Into<String>) -> Self {
        self.best_time_to_visit = Some(best_time.into());
        self
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// One email thread with a prospect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub prospect_id: Uuid,
    pub thread_subject: String,
    pub status: ConversationStatus,
    pub outcome: Option<Outcome>,
    pub intent: Option<IntentAssessment>,
    /// Last computed engagement score, used to detect hot-threshold crossings.
    pub lead_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Inbound from the prospect.
    Prospect,
    /// Model output recorded without being sent.
    Generated,
    /// Delivered to the prospect.
    Sent,
}

impl MessageRole {
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Generated | Self::Sent)
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prospect => write!(f, "prospect"),
            Self::Generated => write!(f, "generated"),
            Self::Sent => write!(f, "sent"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prospect" => Ok(Self::Prospect),
            "generated" => Ok(Self::Generated),
            "sent" => Ok(Self::Sent),
            _ => Err(format!("Unknown message role: {s}")),
        }
    }
}

/// Append-only transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Disposition of a drafted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Approved,
    Edited,
    Rejected,
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Edited => write!(f, "edited"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "edited" => Ok(Self::Edited),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown pending status: {s}")),
        }
    }
}

/// A drafted outbound message awaiting human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub llm_content: String,
    pub edited_content: Option<String>,
    pub status: PendingStatus,
    /// Backend that produced the draft ("grok", "openai", "template").
    pub provider: String,
    /// Set on closing drafts; sending one completes the conversation.
    pub closes_with: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub actioned_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl PendingResponse {
    /// The text that goes out: the human edit when present, else the draft.
    pub fn final_content(&self) -> &str {
        self.edited_content.as_deref().unwrap_or(&self.llm_content)
    }

    pub fn is_open(&self) -> bool {
        self.status == PendingStatus::Pending
    }
}

/// A draft plus enough thread context to review it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingReview {
    pub pending: PendingResponse,
    pub prospect_email: String,
    pub prospect_name: String,
    pub thread_subject: String,
    pub outcome: Option<Outcome>,
}

/// Point-in-time view of a conversation and its transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationThread {
    pub prospect: Prospect,
    pub conversation: Conversation,
    /// Ordered by creation time.
    pub messages: Vec<Message>,
}

impl ConversationThread {
    pub fn prospect_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == MessageRole::Prospect)
    }

    pub fn last_role(&self) -> Option<MessageRole> {
        self.messages.last().map(|m| m.role)
    }

    /// Append an inbound message that has not been persisted yet.
    pub fn with_inbound(mut self, content: &str, at: DateTime<Utc>) -> Self {
        self.messages.push(Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation.id,
            role: MessageRole::Prospect,
            content: content.to_string(),
            created_at: at,
        });
        self.conversation.last_message_at = at;
        self
    }
}
