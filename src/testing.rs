//! Test doubles shared by unit tests: a scripted model, a keyword
//! classifier, a counting notifier, and an in-memory transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channels::transport::{HotLeadNotifier, LeadTransport, NewLead, OpenThread, ProspectReply};
use crate::config::ScoringConfig;
use crate::error::{LlmError, TransportError};
use crate::leads::classifier::{Assessment, OutcomeClassifier};
use crate::leads::engine::ConversationEngine;
use crate::leads::model::{Conversation, ConversationThread, Outcome, Prospect};
use crate::leads::processor::LeadProcessor;
use crate::leads::scoring::{LeadScore, ScoringEngine};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::prompts::seed_default_prompts;
use crate::store::LibSqlBackend;

/// Returns a fixed reply for every call.
pub(crate) struct Scripted;

#[async_trait]
impl LlmProvider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }
    fn model_name(&self) -> &str {
        "scripted-1"
    }
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let content = if request.response_schema.is_some() {
            r#"{"reply":"What days suit you?","intent":{"primary_intent":"weight_loss","confidence":0.9}}"#
        } else {
            "See you then!"
        };
        Ok(CompletionResponse {
            content: content.into(),
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            provider: "scripted".into(),
        })
    }
}

/// Agrees when the message says "works".
pub(crate) struct KeywordVerdict;

#[async_trait]
impl OutcomeClassifier for KeywordVerdict {
    async fn assess(&self, _history: &ConversationThread, latest: &str) -> Assessment {
        if latest.contains("works") {
            Assessment::from_outcome(Some(Outcome::AgreedToFreeClass), "logistics")
        } else {
            Assessment::ongoing()
        }
    }
}

#[derive(Default)]
pub(crate) struct CountingNotifier(pub AtomicUsize);

#[async_trait]
impl HotLeadNotifier for CountingNotifier {
    async fn notify_hot_lead(
        &self,
        _conversation: &Conversation,
        _prospect: &Prospect,
        _score: &LeadScore,
    ) -> Result<(), TransportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Outbox {
    pub leads: Mutex<Vec<NewLead>>,
    pub replies: Mutex<Vec<ProspectReply>>,
    /// (to, subject, body) per delivered message.
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub fail_send: AtomicBool,
    pub fail_replies: bool,
}

#[async_trait]
impl LeadTransport for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }
    async fn fetch_new_leads(&self) -> Result<Vec<NewLead>, TransportError> {
        Ok(std::mem::take(&mut *self.leads.lock().unwrap()))
    }
    async fn fetch_replies(&self, _open: &[OpenThread]) -> Result<Vec<ProspectReply>, TransportError> {
        if self.fail_replies {
            return Err(TransportError::FetchFailed {
                name: "outbox".into(),
                reason: "mailbox unavailable".into(),
            });
        }
        Ok(std::mem::take(&mut *self.replies.lock().unwrap()))
    }
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                name: "outbox".into(),
                reason: "offline".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.into(), subject.into(), body.into()));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub db: Arc<LibSqlBackend>,
    pub notifier: Arc<CountingNotifier>,
    pub outbox: Arc<Outbox>,
    pub processor: Arc<LeadProcessor>,
}

pub(crate) async fn harness_with(outbox: Outbox) -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    seed_default_prompts(db.as_ref()).await.unwrap();
    let notifier = Arc::new(CountingNotifier::default());
    let outbox = Arc::new(outbox);
    let engine = ConversationEngine::new(Arc::new(Scripted), db.clone(), Arc::new(KeywordVerdict));
    let processor = Arc::new(LeadProcessor::new(
        db.clone(),
        engine,
        ScoringEngine::new(ScoringConfig::default()),
        notifier.clone(),
        outbox.clone(),
    ));
    Harness {
        db,
        notifier,
        outbox,
        processor,
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with(Outbox::default()).await
}
