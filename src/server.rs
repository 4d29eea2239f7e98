//! HTTP surface: submit emails, read the audit trail and schedule records.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::error::Error;
use crate::orchestrator::Orchestrator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router.
pub fn routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/emails", post(submit_email))
        .route("/api/emails/{id}/audit", get(email_audit))
        .route("/api/schedule/{key}", get(schedule_record))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "mail-maestro"
    }))
}

async fn submit_email(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.orchestrator.process_raw(body).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(Error::Context(e)) => {
            warn!(error = %e, "Rejected malformed email context");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": e.to_string()})),
            )
        }
        Err(e) => {
            error!(error = %e, "Email processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn email_audit(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orchestrator.audit().entries_for(&id).await {
        Ok(entries) => (StatusCode::OK, Json(json!(entries))),
        Err(e) => {
            error!(email_id = %id, error = %e, "Audit lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn schedule_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.scheduler().get(&key).await {
        Ok(Some(record)) => (StatusCode::OK, Json(json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Schedule record not found"})),
        ),
        Err(e) => {
            error!(key = %key, error = %e, "Schedule lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::TriageConfig;
    use crate::context::test_support::raw_context;
    use crate::scheduler::backend::test_support::MemoryBackend;
    use crate::store::LibSqlBackend;

    async fn app() -> Router {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orchestrator = Orchestrator::new(
            db,
            Arc::new(MemoryBackend::default()),
            TriageConfig::default(),
        );
        routes(Arc::new(orchestrator))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_email(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/emails")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn malformed_context_is_422() {
        let mut raw = serde_json::to_value(raw_context("h-1", "Hi", "body")).unwrap();
        raw.as_object_mut().unwrap().remove("thread_id");

        let response = app().await.oneshot(post_email(raw)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("thread_id"));
    }

    #[tokio::test]
    async fn submitted_email_returns_outcome() {
        let raw = serde_json::to_value(raw_context("h-2", "Your receipt", "Order #9")).unwrap();

        let response = app().await.oneshot(post_email(raw)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["email_id"], "h-2");
        assert_eq!(body["decision"]["route"], "transactional");
    }

    #[tokio::test]
    async fn unknown_schedule_key_is_404() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/api/schedule/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
