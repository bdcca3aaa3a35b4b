//! REST endpoints for reviewing drafts.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ApprovalError, DatabaseError, PipelineError};
use crate::leads::processor::LeadProcessor;

type ApiResponse = (StatusCode, Json<Value>);

/// Build the Axum router for the approval API.
pub fn approval_routes(processor: Arc<LeadProcessor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/pending", get(list_pending))
        .route("/api/pending/{id}/approve", post(approve_pending))
        .route("/api/pending/{id}/reject", post(reject_pending))
        .route("/api/conversations/{id}/score", get(score_conversation))
        .route("/api/sweep", post(sweep_cold))
        .layer(cors)
        .with_state(processor)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "lead-qualifier"
    }))
}

// ── Drafts ──────────────────────────────────────────────────────────

async fn list_pending(State(processor): State<Arc<LeadProcessor>>) -> ApiResponse {
    match processor.pending().await {
        Ok(pending) => (StatusCode::OK, Json(json!(pending))),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    text: Option<String>,
}

async fn approve_pending(
    State(processor): State<Arc<LeadProcessor>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse {
    let Some(id) = parse_id(&id) else {
        return bad_request("Invalid pending response ID");
    };

    // The body is optional; an empty one approves as drafted.
    let request: ApproveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ApproveRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return bad_request(&format!("Invalid JSON body: {e}")),
        }
    };

    match processor.approve(id, request.text).await {
        Ok(message) => {
            info!(pending_id = %id, "Draft approved via API");
            (StatusCode::OK, Json(json!({ "status": "sent", "message": message })))
        }
        Err(e) => error_response(e),
    }
}

async fn reject_pending(
    State(processor): State<Arc<LeadProcessor>>,
    Path(id): Path<String>,
) -> ApiResponse {
    let Some(id) = parse_id(&id) else {
        return bad_request("Invalid pending response ID");
    };

    match processor.reject(id).await {
        Ok(pending) => (StatusCode::OK, Json(json!(pending))),
        Err(e) => error_response(e),
    }
}

// ── Conversations ───────────────────────────────────────────────────

async fn score_conversation(
    State(processor): State<Arc<LeadProcessor>>,
    Path(id): Path<String>,
) -> ApiResponse {
    let Some(id) = parse_id(&id) else {
        return bad_request("Invalid conversation ID");
    };

    match processor.score(id).await {
        Ok(score) => (StatusCode::OK, Json(json!(score))),
        Err(e) => error_response(e),
    }
}

async fn sweep_cold(State(processor): State<Arc<LeadProcessor>>) -> ApiResponse {
    match processor.sweep_cold().await {
        Ok(marked) => {
            let ids: Vec<Uuid> = marked.iter().map(|c| c.id).collect();
            (StatusCode::OK, Json(json!({ "marked": ids.len(), "conversations": ids })))
        }
        Err(e) => error_response(e),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn bad_request(message: &str) -> ApiResponse {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn error_response(e: PipelineError) -> ApiResponse {
    let status = match &e {
        PipelineError::Approval(ApprovalError::NotFound { .. })
        | PipelineError::Approval(ApprovalError::Database(DatabaseError::NotFound { .. }))
        | PipelineError::Database(DatabaseError::NotFound { .. })
        | PipelineError::UnknownThread { .. } => StatusCode::NOT_FOUND,
        PipelineError::Approval(ApprovalError::NotPending { .. }) => StatusCode::CONFLICT,
        PipelineError::Approval(ApprovalError::EmptyEdit { .. }) => StatusCode::BAD_REQUEST,
        PipelineError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "API request failed");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    use super::*;
    use crate::channels::transport::NewLead;
    use crate::leads::processor::InboundEvent;
    use crate::testing::{Harness, harness};

    async fn call(h: &Harness, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let app = approval_routes(h.processor.clone());
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn queued_opening(h: &Harness) -> (Uuid, Uuid) {
        let processed = h
            .processor
            .process_inbound(InboundEvent::NewLead(NewLead {
                email: "jo@example.com".into(),
                first_name: "Jo".into(),
                phone: None,
                thread_subject: "New Prospect Notification".into(),
                location: None,
                received_at: Utc::now(),
            }))
            .await
            .unwrap();
        (processed.pending.unwrap().id, processed.conversation.id)
    }

    #[tokio::test]
    async fn health_ok() {
        let h = harness().await;
        let (status, body) = call(&h, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn pending_lists_review_context() {
        let h = harness().await;
        queued_opening(&h).await;
        let (status, body) = call(&h, "GET", "/api/pending", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["prospect_email"], "jo@example.com");
        assert_eq!(body[0]["pending"]["status"], "pending");
    }

    #[tokio::test]
    async fn approve_with_edit_sends_edit() {
        let h = harness().await;
        let (id, _) = queued_opening(&h).await;

        let (status, body) = call(
            &h,
            "POST",
            &format!("/api/pending/{id}/approve"),
            r#"{"text":"Hey Jo, welcome!"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["content"], "Hey Jo, welcome!");
        assert_eq!(h.outbox.sent.lock().unwrap()[0].2, "Hey Jo, welcome!");
    }

    #[tokio::test]
    async fn approve_without_body_sends_draft() {
        let h = harness().await;
        let (id, _) = queued_opening(&h).await;
        let (status, _) = call(&h, "POST", &format!("/api/pending/{id}/approve"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.outbox.sent.lock().unwrap()[0].2.starts_with("Hi Jo!"));
    }

    #[tokio::test]
    async fn error_statuses() {
        let h = harness().await;
        let (id, _) = queued_opening(&h).await;

        let (status, _) = call(&h, "POST", "/api/pending/not-a-uuid/approve", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = Uuid::new_v4();
        let (status, _) = call(&h, "POST", &format!("/api/pending/{missing}/reject"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&h, "POST", &format!("/api/pending/{id}/approve"), r#"{"text":"  "}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h, "POST", &format!("/api/pending/{id}/reject"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "rejected");

        let (status, _) = call(&h, "POST", &format!("/api/pending/{id}/reject"), "").await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn score_and_sweep() {
        let h = harness().await;
        let (_, conversation_id) = queued_opening(&h).await;

        let (status, body) = call(&h, "GET", &format!("/api/conversations/{conversation_id}/score"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_hot"], false);
        assert_eq!(body["reason"], "No engagement yet");

        let missing = Uuid::new_v4();
        let (status, _) = call(&h, "GET", &format!("/api/conversations/{missing}/score"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&h, "POST", "/api/sweep", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["marked"], 0);
    }
}
