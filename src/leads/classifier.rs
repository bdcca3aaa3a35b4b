//! Outcome classification: decides after each prospect message whether the
//! conversation should end, and how.
//!
//! Flow:
//! 1. Rules (fast, no LLM) → may short-circuit
//! 2. LLM assessment on a single pinned provider → schema-constrained JSON
//! 3. Any failure → the conversation carries on

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LlmError, PipelineError};
use crate::leads::model::{ConversationThread, MessageRole, Outcome};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, ResponseSchema};
use crate::prompts::{ASSESSMENT_PROMPT, PromptStore, render_assessment};

/// Temperature for assessment (deterministic-ish).
const ASSESSMENT_TEMPERATURE: f32 = 0.1;

/// Max tokens for the assessment call. The verdict is a short JSON object.
const ASSESSMENT_MAX_TOKENS: u32 = 150;

/// An end/continue verdict.
///
/// Only constructible through [`Assessment::from_outcome`] and
/// [`Assessment::ongoing`], so `should_end` is true exactly when an outcome
/// is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    should_end: bool,
    outcome: Option<Outcome>,
    reasoning: String,
}

impl Assessment {
    pub fn from_outcome(outcome: Option<Outcome>, reasoning: impl Into<String>) -> Self {
        Self {
            should_end: outcome.is_some(),
            outcome,
            reasoning: reasoning.into(),
        }
    }

    /// Keep talking.
    pub fn ongoing() -> Self {
        Self::from_outcome(None, "continue")
    }

    pub fn should_end(&self) -> bool {
        self.should_end
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

/// Decides whether a conversation is over.
///
/// Implementations never fail: anything that goes wrong is reported as
/// [`Assessment::ongoing`].
#[async_trait]
pub trait OutcomeClassifier: Send + Sync {
    /// `history` is the transcript before `latest` arrived.
    async fn assess(&self, history: &ConversationThread, latest: &str) -> Assessment;
}

/// A compiled cue and the outcome it implies.
#[derive(Debug, Clone)]
pub struct OutcomeRule {
    pub regex: Regex,
    pub outcome: Outcome,
    pub reason: String,
}

/// Deterministic cues that settle a message without a model call.
///
/// Declines are checked before agreement cues, so "no thanks, Tuesday is
/// bad" is a decline. A negated message ("I can't make Tuesday evening")
/// never matches an agreement cue; the model decides it.
#[derive(Debug, Clone)]
pub struct OutcomeRules {
    rules: Vec<OutcomeRule>,
    negation: Regex,
}

fn negation_regex() -> Regex {
    Regex::new(r"(?i)(can(?:'|’)?t|cannot|won(?:'|’)?t|don(?:'|’)?t|doesn(?:'|’)?t|isn(?:'|’)?t|not|never|unable)")
        .unwrap()
}

impl OutcomeRules {
    pub fn default_rules() -> Self {
        let rules = vec![
            OutcomeRule {
                regex: Regex::new(
                    r"(?i)\b(not interested|no thanks|no,? thank you|i(?:'|’)?ll pass|not for me|unsubscribe|stop emailing)\b",
                )
                .unwrap(),
                outcome: Outcome::NotInterested,
                reason: "explicit decline".into(),
            },
            // "Tuesday evening", "saturday mornings"
            OutcomeRule {
                regex: Regex::new(
                    r"(?i)\b(mon|tues|wednes|thurs|fri|satur|sun)day\s+(morning|afternoon|evening|night)s?\b",
                )
                .unwrap(),
                outcome: Outcome::AgreedToFreeClass,
                reason: "named a day and time to attend".into(),
            },
            // "mornings work", "weekends are best"
            OutcomeRule {
                regex: Regex::new(
                    r"(?i)\b(mornings?|afternoons?|evenings?|weekends?|weekdays?)\s+(work|works|are best|is best|are good|is good)\b",
                )
                .unwrap(),
                outcome: Outcome::AgreedToFreeClass,
                reason: "stated availability".into(),
            },
            // "I can do 6pm", "at 7:30 am"
            OutcomeRule {
                regex: Regex::new(r"(?i)\b(i can do|i can make|at)\s+\d{1,2}(:\d{2})?\s*(am|pm)\b")
                    .unwrap(),
                outcome: Outcome::AgreedToFreeClass,
                reason: "proposed a time".into(),
            },
            OutcomeRule {
                regex: Regex::new(
                    r"(?i)\b(works for me|sign me up|count me in|book me|what should i bring|what do i (need to )?bring|where are you located|where is the gym)\b",
                )
                .unwrap(),
                outcome: Outcome::AgreedToFreeClass,
                reason: "attendance logistics".into(),
            },
        ];
        Self {
            rules,
            negation: negation_regex(),
        }
    }

    /// No rules: every message goes to the model.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            negation: negation_regex(),
        }
    }

    /// Add a custom cue.
    pub fn add_rule(&mut self, pattern: &str, outcome: Outcome, reason: &str) -> Result<(), regex::Error> {
        self.rules.push(OutcomeRule {
            regex: Regex::new(pattern)?,
            outcome,
            reason: reason.into(),
        });
        Ok(())
    }

    /// First matching rule wins. `None` means fall through to the model.
    pub fn evaluate(&self, text: &str) -> Option<Assessment> {
        let negated = self.negation.is_match(text);
        self.rules
            .iter()
            .filter(|rule| !(negated && rule.outcome == Outcome::AgreedToFreeClass))
            .find(|rule| rule.regex.is_match(text))
            .map(|rule| Assessment::from_outcome(Some(rule.outcome), rule.reason.clone()))
    }
}

/// Classifier backed by one specific model provider.
///
/// Deliberately not a failover chain: one backend answers every assessment.
pub struct LlmOutcomeClassifier {
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<dyn PromptStore>,
    rules: OutcomeRules,
}

impl LlmOutcomeClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, prompts: Arc<dyn PromptStore>) -> Self {
        Self {
            llm,
            prompts,
            rules: OutcomeRules::default_rules(),
        }
    }

    pub fn with_rules(mut self, rules: OutcomeRules) -> Self {
        self.rules = rules;
        self
    }

    async fn ask_model(
        &self,
        history: &ConversationThread,
        latest: &str,
    ) -> Result<Assessment, PipelineError> {
        let template = self.prompts.get_active_content(ASSESSMENT_PROMPT).await?;
        let prompt = render_assessment(&template, &format_transcript(history), latest);

        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are a conversation analyzer. Return only valid JSON."),
            ChatMessage::user(prompt),
        ])
        .with_temperature(ASSESSMENT_TEMPERATURE)
        .with_max_tokens(ASSESSMENT_MAX_TOKENS)
        .with_schema(assessment_schema());

        let response = self.llm.complete(request).await?;
        let raw: RawAssessment = response.parse_json()?;

        let outcome = match raw.outcome.as_str() {
            "agreed_to_free_class" => Some(Outcome::AgreedToFreeClass),
            "not_interested" => Some(Outcome::NotInterested),
            "continue" => None,
            other => {
                return Err(LlmError::InvalidResponse {
                    provider: response.provider,
                    reason: format!("unknown outcome '{other}'"),
                }
                .into());
            }
        };

        if raw.should_end != outcome.is_some() {
            warn!(
                should_end = raw.should_end,
                outcome = %raw.outcome,
                "Assessment disagrees with itself, trusting the outcome"
            );
        }

        Ok(Assessment::from_outcome(
            outcome,
            raw.reasoning.unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl OutcomeClassifier for LlmOutcomeClassifier {
    async fn assess(&self, history: &ConversationThread, latest: &str) -> Assessment {
        if let Some(assessment) = self.rules.evaluate(latest) {
            debug!(
                conversation_id = %history.conversation.id,
                reason = assessment.reasoning(),
                "Outcome rule matched, skipping LLM assessment"
            );
            return assessment;
        }

        match self.ask_model(history, latest).await {
            Ok(assessment) => {
                debug!(
                    conversation_id = %history.conversation.id,
                    outcome = ?assessment.outcome(),
                    provider = self.llm.name(),
                    "LLM assessment complete"
                );
                assessment
            }
            Err(e) => {
                warn!(
                    conversation_id = %history.conversation.id,
                    error = %e,
                    "Outcome assessment failed, treating conversation as ongoing"
                );
                Assessment::ongoing()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    should_end: bool,
    outcome: String,
    reasoning: Option<String>,
}

fn assessment_schema() -> ResponseSchema {
    ResponseSchema::new(
        "conversation_assessment",
        serde_json::json!({
            "type": "object",
            "properties": {
                "should_end": { "type": "boolean" },
                "outcome": {
                    "type": "string",
                    "enum": ["agreed_to_free_class", "not_interested", "continue"]
                },
                "reasoning": { "type": "string" }
            },
            "required": ["should_end", "outcome", "reasoning"],
            "additionalProperties": false
        }),
    )
}

/// One line per message, labelled by speaker.
pub(crate) fn format_transcript(thread: &ConversationThread) -> String {
    thread
        .messages
        .iter()
        .map(|m| {
            let speaker = match m.role {
                MessageRole::Prospect => "PROSPECT",
                MessageRole::Generated | MessageRole::Sent => "SALES",
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
