//! Conversation engine: produces the next outbound draft for a thread.
//!
//! **No outbound message without human approval.** Everything produced
//! here is a draft; the processor queues it and a person decides.
//!
//! Per inbound message:
//! 1. Outcome already decided on an active thread → fresh closing, same outcome
//! 2. Exchange limit → forced `reached_message_limit` closing
//! 3. Outcome classifier → closing for a decided outcome
//! 4. Otherwise a normal turn, with intent as a side channel

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{LlmError, PipelineError};
use crate::leads::classifier::OutcomeClassifier;
use crate::leads::model::{ConversationThread, Intent, IntentAssessment, Message, MessageRole, Outcome};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, ResponseSchema};
use crate::prompts::{CLOSING_PROMPT, ClosingPrompts, PromptStore, SALES_SYSTEM_PROMPT};

/// Temperature for a normal turn.
const TURN_TEMPERATURE: f32 = 0.3;

/// Max tokens for a turn. Leaves room for the intent object.
const TURN_MAX_TOKENS: u32 = 300;

const CLOSING_TEMPERATURE: f32 = 0.2;
const CLOSING_MAX_TOKENS: u32 = 100;

/// How many trailing messages the closing call sees.
const CLOSING_CONTEXT_MESSAGES: usize = 3;

/// Provider label for drafts that never touched a model.
pub const TEMPLATE_PROVIDER: &str = "template";

/// Text produced for one outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTurn {
    pub reply: String,
    pub intent: Option<IntentAssessment>,
    /// Backend that served the call.
    pub provider: String,
}

/// The engine's answer to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub text: String,
    pub provider: String,
    /// Set when this draft is a closing message.
    pub outcome: Option<Outcome>,
    pub intent: Option<IntentAssessment>,
}

pub struct ConversationEngine {
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<dyn PromptStore>,
    classifier: Arc<dyn OutcomeClassifier>,
}

impl ConversationEngine {
    /// `llm` is normally a failover chain; the classifier carries its own
    /// pinned provider.
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        prompts: Arc<dyn PromptStore>,
        classifier: Arc<dyn OutcomeClassifier>,
    ) -> Self {
        Self {
            llm,
            prompts,
            classifier,
        }
    }

    /// First message to a new lead. Fixed template, no model call.
    pub fn generate_opening(&self, first_name: &str) -> GeneratedTurn {
        let reply = format!(
            "Hi {first_name}!\n\n\
             Thanks for your interest in our boxing fitness gym. To help us find the right fit for you, could you tell me:\n\n\
             1. What's your main fitness goal right now?\n\
             2. How often do you currently exercise?\n\
             3. Do you have any concerns about trying a high-intensity class?\n\n\
             Looking forward to hearing from you!"
        );
        GeneratedTurn {
            reply,
            intent: None,
            provider: TEMPLATE_PROVIDER.to_string(),
        }
    }

    /// Completed prospect↔reply pairs in the transcript.
    pub fn exchange_count(thread: &ConversationThread) -> u32 {
        (thread.messages.len() / 2) as u32
    }

    /// Sales system prompt followed by the transcript. Prospect messages
    /// are user turns; everything we generated or sent is an assistant turn.
    pub async fn build_context(
        &self,
        thread: &ConversationThread,
    ) -> Result<Vec<ChatMessage>, PipelineError> {
        let system = self.prompts.get_active_content(SALES_SYSTEM_PROMPT).await?;
        let mut messages = Vec::with_capacity(thread.messages.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(thread.messages.iter().map(to_chat));
        Ok(messages)
    }

    /// Next reply plus an optional intent read, in one schema-constrained call.
    pub async fn generate_turn(
        &self,
        thread: &ConversationThread,
    ) -> Result<GeneratedTurn, PipelineError> {
        let context = self.build_context(thread).await?;
        let request = CompletionRequest::new(context)
            .with_temperature(TURN_TEMPERATURE)
            .with_max_tokens(TURN_MAX_TOKENS)
            .with_schema(turn_schema());

        let response = self.llm.complete(request).await?;
        let (reply, intent) = parse_turn(&response.content, &response.provider)?;

        debug!(
            conversation_id = %thread.conversation.id,
            provider = %response.provider,
            intent = ?intent.as_ref().map(|i| i.primary_intent),
            output_tokens = response.output_tokens,
            "Generated turn"
        );
        Ok(GeneratedTurn {
            reply,
            intent,
            provider: response.provider,
        })
    }

    /// Closing message for a decided outcome.
    pub async fn generate_closing(
        &self,
        thread: &ConversationThread,
        outcome: Outcome,
    ) -> Result<GeneratedTurn, PipelineError> {
        let content = self.prompts.get_active_content(CLOSING_PROMPT).await?;
        let first_name = thread.prospect.first_name.as_str();
        let instructions = ClosingPrompts::parse(&content)?.render(outcome, first_name);

        let mut context = vec![ChatMessage::system(instructions)];
        let skip = thread.messages.len().saturating_sub(CLOSING_CONTEXT_MESSAGES);
        context.extend(thread.messages.iter().skip(skip).map(to_chat));
        context.push(ChatMessage::user(format!(
            "Generate the closing message for {first_name}."
        )));

        let request = CompletionRequest::new(context)
            .with_temperature(CLOSING_TEMPERATURE)
            .with_max_tokens(CLOSING_MAX_TOKENS);
        let response = self.llm.complete(request).await?;

        let reply = response.content.trim();
        if reply.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: response.provider,
                reason: "empty closing message".into(),
            }
            .into());
        }

        Ok(GeneratedTurn {
            reply: reply.to_string(),
            intent: None,
            provider: response.provider,
        })
    }

    /// Decide and draft the response to `latest`.
    ///
    /// `history` is the stored transcript without `latest`. An outcome
    /// already recorded on an active thread is kept and its closing
    /// redrafted. Otherwise the limit check runs first, so a thread at the
    /// limit always closes with `reached_message_limit`.
    pub async fn respond(
        &self,
        history: &ConversationThread,
        latest: &str,
        at: DateTime<Utc>,
        max_exchanges: u32,
    ) -> Result<Draft, PipelineError> {
        let thread = history.clone().with_inbound(latest, at);
        let exchanges = Self::exchange_count(&thread);

        let decided = history
            .conversation
            .outcome
            .filter(|_| !history.conversation.status.is_closed());

        let outcome = if let Some(decided) = decided {
            // Closing not sent yet: a follow-up gets a fresh closing.
            debug!(
                conversation_id = %thread.conversation.id,
                outcome = %decided,
                "Outcome already decided, redrafting closing"
            );
            Some(decided)
        } else if exchanges >= max_exchanges {
            info!(
                conversation_id = %thread.conversation.id,
                exchanges,
                max_exchanges,
                "Exchange limit reached"
            );
            Some(Outcome::ReachedMessageLimit)
        } else {
            self.classifier.assess(history, latest).await.outcome()
        };

        if let Some(outcome) = outcome {
            let closing = self.generate_closing(&thread, outcome).await?;
            info!(
                conversation_id = %thread.conversation.id,
                outcome = %outcome,
                provider = %closing.provider,
                "Drafted closing message"
            );
            return Ok(Draft {
                text: closing.reply,
                provider: closing.provider,
                outcome: Some(outcome),
                intent: None,
            });
        }

        let turn = self.generate_turn(&thread).await?;
        Ok(Draft {
            text: turn.reply,
            provider: turn.provider,
            outcome: None,
            intent: turn.intent,
        })
    }
}

fn to_chat(message: &Message) -> ChatMessage {
    match message.role {
        MessageRole::Prospect => ChatMessage::user(message.content.clone()),
        MessageRole::Generated | MessageRole::Sent => ChatMessage::assistant(message.content.clone()),
    }
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    reply: String,
    #[serde(default)]
    intent: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    primary_intent: Intent,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    best_time_to_visit: Option<String>,
}

/// Split model output into reply and intent.
///
/// A broken intent object is dropped. Output that is plain prose rather
/// than JSON is taken as the reply with no intent.
fn parse_turn(content: &str, provider: &str) -> Result<(String, Option<IntentAssessment>), LlmError> {
    let trimmed = content.trim();
    let (reply, intent) = match serde_json::from_str::<RawTurn>(&crate::llm::provider::extract_json_object(trimmed)) {
        Ok(raw) => {
            let intent = raw.intent.and_then(|v| match serde_json::from_value::<RawIntent>(v) {
                Ok(i) => {
                    let mut assessment = IntentAssessment::new(i.primary_intent, i.confidence);
                    assessment.reasoning = i.reasoning.filter(|r| !r.trim().is_empty());
                    assessment.best_time_to_visit =
                        i.best_time_to_visit.filter(|t| !t.trim().is_empty());
                    Some(assessment)
                }
                Err(e) => {
                    debug!(error = %e, "Dropping malformed intent payload");
                    None
                }
            });
            (raw.reply.trim().to_string(), intent)
        }
        Err(e) if trimmed.contains('{') => {
            return Err(LlmError::InvalidResponse {
                provider: provider.to_string(),
                reason: format!("unparsable turn payload: {e}"),
            });
        }
        Err(_) => (trimmed.to_string(), None),
    };

    if reply.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "empty reply".into(),
        });
    }
    Ok((reply, intent))
}

fn turn_schema() -> ResponseSchema {
    let intents: Vec<&str> = Intent::ALL.iter().map(|i| i.as_str()).collect();
    ResponseSchema::new(
        "sales_turn",
        serde_json::json!({
            "type": "object",
            "properties": {
                "reply": { "type": "string" },
                "intent": {
                    "anyOf": [
                        {
                            "type": "object",
                            "properties": {
                                "primary_intent": { "type": "string", "enum": intents },
                                "confidence": { "type": "number" },
                                "reasoning": { "type": "string" },
                                "best_time_to_visit": { "type": ["string", "null"] }
                            },
                            "required": ["primary_intent", "confidence", "reasoning", "best_time_to_visit"],
                            "additionalProperties": false
                        },
                        { "type": "null" }
                    ]
                }
            },
            "required": ["reply", "intent"],
            "additionalProperties": false
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::leads::classifier::Assessment;
    use crate::leads::model::{Conversation, ConversationStatus, Prospect};
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use crate::prompts::seed_default_prompts;
    use crate::store::LibSqlBackend;

    /// Returns a fixed body and remembers the last request.
    struct Recorder {
        body: String,
        last: Mutex<Option<CompletionRequest>>,
    }

    impl Recorder {
        fn new(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: body.into(),
                last: Mutex::new(None),
            })
        }

        fn last_request(&self) -> CompletionRequest {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl LlmProvider for Recorder {
        fn name(&self) -> &str {
            "grok"
        }

        fn model_name(&self) -> &str {
            "recorder"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.last.lock().unwrap() = Some(request);
            Ok(CompletionResponse {
                content: self.body.clone(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                provider: "grok".into(),
            })
        }
    }

    /// Always returns the same verdict and counts calls.
    struct FixedVerdict {
        outcome: Option<Outcome>,
        calls: AtomicUsize,
    }

    impl FixedVerdict {
        fn new(outcome: Option<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OutcomeClassifier for FixedVerdict {
        async fn assess(&self, _history: &ConversationThread, _latest: &str) -> Assessment {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Assessment::from_outcome(self.outcome, "fixed")
        }
    }

    const TURN_JSON: &str = r#"{"reply": "Great goal! Want to try a free class?", "intent": {"primary_intent": "weight_loss", "confidence": 0.85, "reasoning": "mentioned losing weight", "best_time_to_visit": "evenings"}}"#;

    async fn engine(llm: Arc<Recorder>, verdict: Arc<FixedVerdict>) -> ConversationEngine {
        let store = LibSqlBackend::new_memory().await.unwrap();
        seed_default_prompts(&store).await.unwrap();
        ConversationEngine::new(llm, Arc::new(store), verdict)
    }

    /// A thread with `pairs` prospect/sent exchanges.
    fn thread(pairs: usize) -> ConversationThread {
        let t0 = Utc::now() - Duration::hours(2);
        let prospect = Prospect {
            id: Uuid::new_v4(),
            email: "ana@example.com".into(),
            first_name: "Ana".into(),
            phone: None,
            created_at: t0,
            updated_at: t0,
        };
        let conversation_id = Uuid::new_v4();
        let mut messages = Vec::new();
        for i in 0..pairs {
            for (role, text) in [(MessageRole::Sent, "question"), (MessageRole::Prospect, "answer")] {
                messages.push(Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    role,
                    content: format!("{text} {i}"),
                    created_at: t0 + Duration::minutes(messages.len() as i64),
                });
            }
        }
        ConversationThread {
            conversation: Conversation {
                id: conversation_id,
                prospect_id: prospect.id,
                thread_subject: "New Prospect Notification - Downtown".into(),
                status: ConversationStatus::Active,
                outcome: None,
                intent: None,
                lead_score: None,
                created_at: t0,
                last_message_at: t0,
                updated_at: t0,
            },
            prospect,
            messages,
        }
    }

    #[tokio::test]
    async fn opening_is_a_template() {
        let llm = Recorder::new(TURN_JSON);
        let e = engine(llm.clone(), FixedVerdict::new(None)).await;
        let opening = e.generate_opening("Ana");
        assert!(opening.reply.starts_with("Hi Ana!"));
        assert_eq!(opening.reply.matches("?\n").count(), 3);
        assert_eq!(opening.provider, TEMPLATE_PROVIDER);
        assert!(llm.last.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn context_maps_roles() {
        let e = engine(Recorder::new(TURN_JSON), FixedVerdict::new(None)).await;
        let context = e.build_context(&thread(1)).await.unwrap();
        let roles: Vec<_> = context.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user"]);
    }

    #[tokio::test]
    async fn turn_carries_intent_side_channel() {
        let llm = Recorder::new(TURN_JSON);
        let e = engine(llm.clone(), FixedVerdict::new(None)).await;
        let turn = e.generate_turn(&thread(1)).await.unwrap();

        assert_eq!(turn.reply, "Great goal! Want to try a free class?");
        let intent = turn.intent.unwrap();
        assert_eq!(intent.primary_intent, Intent::WeightLoss);
        assert_eq!(intent.best_time_to_visit.as_deref(), Some("evenings"));

        let req = llm.last_request();
        assert_eq!(req.temperature, Some(TURN_TEMPERATURE));
        assert_eq!(req.max_tokens, Some(TURN_MAX_TOKENS));
        assert!(req.response_schema.is_some());
    }

    #[test]
    fn turn_parsing_tolerates_missing_or_broken_intent() {
        let (reply, intent) = parse_turn(r#"{"reply": "Sure!", "intent": null}"#, "grok").unwrap();
        assert_eq!(reply, "Sure!");
        assert!(intent.is_none());

        let (_, intent) =
            parse_turn(r#"{"reply": "Sure!", "intent": {"primary_intent": "yoga"}}"#, "grok").unwrap();
        assert!(intent.is_none());

        let (reply, intent) = parse_turn("Happy to help with that.", "grok").unwrap();
        assert_eq!(reply, "Happy to help with that.");
        assert!(intent.is_none());

        assert!(parse_turn(r#"{"reply": "  "}"#, "grok").is_err());
        assert!(parse_turn(r#"{"text": "x"}"#, "grok").is_err());
    }

    #[tokio::test]
    async fn closing_uses_outcome_template_and_name() {
        let llm = Recorder::new("  Thanks Ana, see you soon!  ");
        let e = engine(llm.clone(), FixedVerdict::new(None)).await;
        let closing = e
            .generate_closing(&thread(3), Outcome::AgreedToFreeClass)
            .await
            .unwrap();
        assert_eq!(closing.reply, "Thanks Ana, see you soon!");

        let req = llm.last_request();
        assert!(req.messages[0].content.contains("Ana"));
        assert!(req.messages[0].content.contains("agreed"));
        // system + last 3 messages + instruction
        assert_eq!(req.messages.len(), 5);
        assert_eq!(
            req.messages.last().unwrap().content,
            "Generate the closing message for Ana."
        );
        assert_eq!(req.max_tokens, Some(CLOSING_MAX_TOKENS));
    }

    #[tokio::test]
    async fn limit_forces_closing_without_classifier() {
        let verdict = FixedVerdict::new(None);
        let e = engine(Recorder::new("Thanks Ana!"), verdict.clone()).await;

        // 4 stored pairs + the new inbound → 9 messages → 4 exchanges.
        let history = thread(4);
        let draft = e
            .respond(&history, "sounds good, sign me up", Utc::now(), 4)
            .await
            .unwrap();
        assert_eq!(draft.outcome, Some(Outcome::ReachedMessageLimit));
        assert_eq!(verdict.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decided_outcome_drafts_closing() {
        let verdict = FixedVerdict::new(Some(Outcome::NotInterested));
        let e = engine(Recorder::new("All the best, Ana."), verdict.clone()).await;
        let draft = e.respond(&thread(1), "no thanks", Utc::now(), 10).await.unwrap();
        assert_eq!(draft.outcome, Some(Outcome::NotInterested));
        assert_eq!(draft.text, "All the best, Ana.");
        assert_eq!(verdict.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recorded_outcome_is_kept_on_followup() {
        let verdict = FixedVerdict::new(None);
        let e = engine(Recorder::new("See you Tuesday, Ana!"), verdict.clone()).await;
        let mut history = thread(2);
        history.conversation.outcome = Some(Outcome::AgreedToFreeClass);

        let draft = e.respond(&history, "Great, thanks!", Utc::now(), 10).await.unwrap();
        assert_eq!(draft.outcome, Some(Outcome::AgreedToFreeClass));
        assert_eq!(draft.text, "See you Tuesday, Ana!");
        assert_eq!(verdict.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reopened_thread_is_classified_afresh() {
        let verdict = FixedVerdict::new(None);
        let e = engine(Recorder::new(TURN_JSON), verdict.clone()).await;
        let mut history = thread(2);
        history.conversation.outcome = Some(Outcome::AgreedToFreeClass);
        history.conversation.status = ConversationStatus::Complete;

        let draft = e.respond(&history, "Can I reschedule?", Utc::now(), 10).await.unwrap();
        assert_eq!(draft.outcome, None);
        assert_eq!(verdict.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ongoing_conversation_drafts_turn() {
        let llm = Recorder::new(TURN_JSON);
        let e = engine(llm.clone(), FixedVerdict::new(None)).await;
        let draft = e
            .respond(&thread(1), "I want to lose 10 pounds", Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(draft.outcome, None);
        assert!(draft.intent.is_some());
        assert_eq!(draft.provider, "grok");

        // The new inbound is the last thing the model sees.
        let req = llm.last_request();
        assert_eq!(req.messages.last().unwrap().content, "I want to lose 10 pounds");
    }

    #[test]
    fn exchange_count_is_pairs() {
        assert_eq!(ConversationEngine::exchange_count(&thread(0)), 0);
        assert_eq!(ConversationEngine::exchange_count(&thread(3)), 3);
        let odd = thread(2).with_inbound("hi", Utc::now());
        assert_eq!(ConversationEngine::exchange_count(&odd), 2);
    }
}
