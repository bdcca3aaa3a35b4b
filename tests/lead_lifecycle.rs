//! End-to-end tests: leads and replies arrive through an in-memory
//! transport, drafts are reviewed over the real HTTP approval API.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory libSQL database and a stub language model.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use lead_qualifier::approvals::approval_routes;
use lead_qualifier::channels::{LeadTransport, LogNotifier, NewLead, OpenThread, ProspectReply};
use lead_qualifier::config::ScoringConfig;
use lead_qualifier::error::{LlmError, TransportError};
use lead_qualifier::leads::model::{ConversationStatus, Outcome};
use lead_qualifier::leads::{ConversationEngine, LeadProcessor, LlmOutcomeClassifier, ScoringEngine};
use lead_qualifier::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use lead_qualifier::prompts::seed_default_prompts;
use lead_qualifier::store::{LeadStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SUBJECT: &str = "New Prospect Notification - Downtown";

/// Stub model: answers turns and closings, and returns junk for
/// assessments so the classifier has to fall back.
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn name(&self) -> &str {
        "stub"
    }
    fn model_name(&self) -> &str {
        "stub-1"
    }
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let content = match request.response_schema.as_ref().map(|s| s.name.as_str()) {
            Some("sales_turn") => json!({
                "reply": "Great goal! What days work best for a free class?",
                "intent": {
                    "primary_intent": "weight_loss",
                    "confidence": 0.85,
                    "best_time_to_visit": "evenings"
                }
            })
            .to_string(),
            Some(_) => "I'd rather not say".to_string(),
            None => "Perfect, see you Tuesday evening!".to_string(),
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            provider: "stub".into(),
        })
    }
}

/// In-memory mailbox. Replies are only handed out for watched threads.
#[derive(Default)]
struct MemoryInbox {
    leads: Mutex<Vec<NewLead>>,
    replies: Mutex<Vec<ProspectReply>>,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl MemoryInbox {
    fn deliver_lead(&self) {
        self.leads.lock().unwrap().push(NewLead {
            email: "jordan@example.com".into(),
            first_name: "Jordan".into(),
            phone: Some("555-0100".into()),
            thread_subject: SUBJECT.into(),
            location: Some("Downtown".into()),
            received_at: Utc::now(),
        });
    }

    fn deliver_reply(&self, text: &str) {
        self.replies.lock().unwrap().push(ProspectReply {
            thread_subject: SUBJECT.into(),
            prospect_email: "jordan@example.com".into(),
            reply_text: text.into(),
            received_at: Utc::now(),
        });
    }

    fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeadTransport for MemoryInbox {
    fn name(&self) -> &str {
        "memory"
    }
    async fn fetch_new_leads(&self) -> Result<Vec<NewLead>, TransportError> {
        Ok(std::mem::take(&mut *self.leads.lock().unwrap()))
    }
    async fn fetch_replies(&self, open: &[OpenThread]) -> Result<Vec<ProspectReply>, TransportError> {
        let all = std::mem::take(&mut *self.replies.lock().unwrap());
        Ok(all
            .into_iter()
            .filter(|r| {
                open.iter()
                    .any(|t| t.prospect_email == r.prospect_email && t.thread_subject == r.thread_subject)
            })
            .collect())
    }
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.into(), subject.into(), body.into()));
        Ok(())
    }
}

struct TestApp {
    base: String,
    client: reqwest::Client,
    store: Arc<LibSqlBackend>,
    inbox: Arc<MemoryInbox>,
    processor: Arc<LeadProcessor>,
}

impl TestApp {
    async fn poll(&self) {
        self.processor.poll_once(self.inbox.as_ref()).await.unwrap();
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(format!("{}{path}", self.base)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut req = self.client.post(format!("{}{path}", self.base));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// The single open draft, as (pending id, draft text).
    async fn only_pending(&self) -> (String, String) {
        let (status, body) = self.get("/api/pending").await;
        assert_eq!(status, 200);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 1, "expected one open draft: {body}");
        let pending = &items[0]["pending"];
        (
            pending["id"].as_str().unwrap().to_string(),
            pending["llm_content"].as_str().unwrap().to_string(),
        )
    }
}

/// Start an Axum server on a random port.
async fn start_app() -> TestApp {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    seed_default_prompts(store.as_ref()).await.unwrap();

    let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm);
    let classifier = Arc::new(LlmOutcomeClassifier::new(Arc::clone(&llm), store.clone()));
    let engine = ConversationEngine::new(llm, store.clone(), classifier);
    let inbox = Arc::new(MemoryInbox::default());
    let processor = Arc::new(LeadProcessor::new(
        store.clone(),
        engine,
        ScoringEngine::new(ScoringConfig::default()),
        Arc::new(LogNotifier),
        inbox.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = approval_routes(Arc::clone(&processor));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap(),
        store,
        inbox,
        processor,
    }
}

#[tokio::test]
async fn lead_runs_to_completed_conversation() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app().await;

        // Lead arrives; opening is queued, nothing sent yet.
        app.inbox.deliver_lead();
        app.poll().await;
        assert!(app.inbox.sent().is_empty());
        let (opening_id, opening) = app.only_pending().await;
        assert!(opening.starts_with("Hi Jordan!"));

        let (status, _) = app.post(&format!("/api/pending/{opening_id}/approve"), None).await;
        assert_eq!(status, 200);
        let sent = app.inbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "jordan@example.com");
        assert_eq!(sent[0].1, format!("Re: {SUBJECT}"));

        // Prospect states a goal; model drafts the next turn.
        app.inbox.deliver_reply("Mostly I want to lose weight before summer");
        app.poll().await;
        let (turn_id, turn) = app.only_pending().await;
        assert_eq!(turn, "Great goal! What days work best for a free class?");

        let (status, body) = app
            .post(
                &format!("/api/pending/{turn_id}/approve"),
                Some(json!({ "text": "Love that goal! Which evening suits you for a free class?" })),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["message"]["content"], "Love that goal! Which evening suits you for a free class?");

        // Logistics reply: agreement, closing drafted, thread still active.
        app.inbox.deliver_reply("Tuesday evening works for me");
        app.poll().await;
        let (closing_id, closing) = app.only_pending().await;
        assert_eq!(closing, "Perfect, see you Tuesday evening!");

        let prospect = app
            .store
            .find_prospect_by_email("jordan@example.com")
            .await
            .unwrap()
            .unwrap();
        let conversation = app
            .store
            .find_conversation(prospect.id, SUBJECT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.outcome, Some(Outcome::AgreedToFreeClass));
        assert_eq!(conversation.status, ConversationStatus::Active);

        let (status, score) = app
            .get(&format!("/api/conversations/{}/score", conversation.id))
            .await;
        assert_eq!(status, 200);
        assert_eq!(score["is_hot"], true);

        // Sending the closing completes the conversation.
        let (status, _) = app.post(&format!("/api/pending/{closing_id}/approve"), None).await;
        assert_eq!(status, 200);
        let done = app.store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(done.status, ConversationStatus::Complete);
        assert_eq!(app.inbox.sent().len(), 3);

        let transcript = app.store.list_messages(conversation.id).await.unwrap();
        assert_eq!(transcript.len(), 5);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn broken_assessment_keeps_conversation_going() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app().await;
        app.inbox.deliver_lead();
        app.poll().await;
        let (opening_id, _) = app.only_pending().await;
        app.post(&format!("/api/pending/{opening_id}/approve"), None).await;

        // No rule matches, the model's assessment is junk: keep talking.
        app.inbox.deliver_reply("tell me more about your schedule philosophy");
        app.poll().await;
        let (_, draft) = app.only_pending().await;
        assert_eq!(draft, "Great goal! What days work best for a free class?");

        let prospect = app
            .store
            .find_prospect_by_email("jordan@example.com")
            .await
            .unwrap()
            .unwrap();
        let conversation = app
            .store
            .find_conversation(prospect.id, SUBJECT)
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.outcome.is_none());
        assert_eq!(conversation.status, ConversationStatus::Active);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rejected_draft_is_never_sent() {
    timeout(TEST_TIMEOUT, async {
        let app = start_app().await;
        app.inbox.deliver_lead();
        app.poll().await;
        let (opening_id, _) = app.only_pending().await;

        let (status, body) = app.post(&format!("/api/pending/{opening_id}/reject"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "rejected");

        let (status, _) = app.post(&format!("/api/pending/{opening_id}/approve"), None).await;
        assert_eq!(status, 409);
        assert!(app.inbox.sent().is_empty());

        let (_, pending) = app.get("/api/pending").await;
        assert!(pending.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
