//! REST API server for the advice orchestrator
//!
//! A thin calling layer over [`TieredAdviceService`]: JSON in, the uniform
//! advice contract out, `429` for quota exhaustion, and an SSE variant for
//! streamed answers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::OrchestrationError;
use crate::models::{ChatMessage, ModelAccess};
use crate::tier::{AdviceOutcome, AdviceRequest, QuotaExceeded, StreamOutcome, TieredAdviceService};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct AdviceHttpRequest {
    pub user_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub force_model: Option<String>,
    #[serde(default)]
    pub skip_escalation: bool,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Not a failure of the service, but the answer was not produced.
    pub fn quota_exceeded(exceeded: &QuotaExceeded) -> Self {
        Self {
            success: false,
            data: serde_json::to_value(exceeded).ok(),
            error: Some(exceeded.message.clone()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TieredAdviceService>,
}

/// =============================
/// Helpers
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> uuid::Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            uuid::Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn to_advice_request(req: AdviceHttpRequest) -> Result<AdviceRequest, Response> {
    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");

    let mut request = AdviceRequest::new(user_id, req.message).with_history(req.history);
    if let Some(raw) = req.force_model.as_deref() {
        let model = ModelAccess::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("Unknown model '{}'", raw))),
            )
                .into_response()
        })?;
        request = request.with_force_model(model);
    }
    if req.skip_escalation {
        request = request.skip_escalation();
    }
    Ok(request)
}

fn error_response(err: OrchestrationError) -> Response {
    let status = match err {
        OrchestrationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    error!(error = %err, "advice request failed");
    (status, Json(ApiResponse::error(err.user_message()))).into_response()
}

fn quota_response(exceeded: &QuotaExceeded) -> Response {
    info!(tier = %exceeded.current_tier, "quota exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ApiResponse::quota_exceeded(exceeded)),
    )
        .into_response()
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Advice Endpoints
/// =============================

async fn advice_handler(
    State(state): State<ApiState>,
    Json(req): Json<AdviceHttpRequest>,
) -> Response {
    let request = match to_advice_request(req) {
        Ok(request) => request,
        Err(response) => return response,
    };
    info!(user_id = %request.user_id, "advice request received");

    match state.service.handle_query(request).await {
        Ok(AdviceOutcome::Answered(advice)) => {
            (StatusCode::OK, Json(ApiResponse::success(&advice))).into_response()
        }
        Ok(AdviceOutcome::QuotaExceeded(exceeded)) => quota_response(&exceeded),
        Err(e) => error_response(e),
    }
}

async fn advice_stream_handler(
    State(state): State<ApiState>,
    Json(req): Json<AdviceHttpRequest>,
) -> Response {
    let request = match to_advice_request(req) {
        Ok(request) => request,
        Err(response) => return response,
    };
    info!(user_id = %request.user_id, "streaming advice request received");

    match state.service.stream_query(request).await {
        Ok(StreamOutcome::Streaming(tiered)) => {
            info!(model = %tiered.model_used, downgraded = tiered.downgraded, "streaming answer");
            let events = tiered.stream.map(|chunk| Event::default().json_data(&chunk));
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Ok(StreamOutcome::QuotaExceeded(exceeded)) => quota_response(&exceeded),
        Err(e) => error_response(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(service: Arc<TieredAdviceService>) -> Router {
    let state = ApiState { service };

    Router::new()
        .route("/health", get(health))
        .route("/api/advice", post(advice_handler))
        .route("/api/advice/stream", post(advice_stream_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    service: Arc<TieredAdviceService>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(service);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::HybridAdviceService;
    use crate::context::ContextBuilder;
    use crate::llm::testing::{Scripted, ScriptedModel};
    use crate::llm::ModelRegistry;
    use crate::storage::InMemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    const USER: &str = "5b0a2f5e-8a53-4c4b-9c1c-0e4f0f3a7e10";

    fn app(fast: Vec<Scripted>) -> (Router, InMemoryStore) {
        let store = InMemoryStore::new();
        let registry = ModelRegistry::new().with(Arc::new(ScriptedModel::new(ModelAccess::Fast, fast)));
        let advice = HybridAdviceService::new(
            Arc::new(registry),
            ContextBuilder::new(Arc::new(store.clone())),
        );
        let service = TieredAdviceService::new(advice, Arc::new(store.clone()));
        (create_router(Arc::new(service)), store)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = parse_or_stable_uuid(Some("user@example.com"), "x");
        let b = parse_or_stable_uuid(Some("user@example.com"), "y");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 4);
        assert_eq!(parse_or_stable_uuid(Some(USER), "x").to_string(), USER);
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app(vec![]);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_advice_answered() {
        let (router, _) = app(vec![Scripted::Reply("Automate your savings.".into())]);
        let response = router
            .oneshot(post_json(
                "/api/advice",
                serde_json::json!({"user_id": USER, "message": "Help me with my budget"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["answer"], "Automate your savings.");
        assert_eq!(body["data"]["model_used"], "fast");
        assert_eq!(body["data"]["downgraded"], false);
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_429() {
        let (router, store) = app(vec![]);
        let user_id = uuid::Uuid::parse_str(USER).unwrap();
        store.set_usage(user_id, ModelAccess::Fast, 50).await;

        let response = router
            .oneshot(post_json(
                "/api/advice",
                serde_json::json!({"user_id": USER, "message": "Help me with my budget"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["data"]["upgrade_required"], true);
        assert_eq!(body["data"]["next_tier"], "basic");
    }

    #[tokio::test]
    async fn test_model_failure_is_user_safe_503() {
        let (router, _) = app(vec![Scripted::Fail(crate::error::AiErrorKind::AuthError)]);
        let response = router
            .oneshot(post_json("/api/advice", serde_json::json!({"message": "hello"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        let error = body["error"].as_str().unwrap();
        assert!(error.contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_force_model_is_400() {
        let (router, _) = app(vec![]);
        let response = router
            .oneshot(post_json(
                "/api/advice",
                serde_json::json!({"message": "hello", "force_model": "gpt-9"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_endpoint_emits_sse() {
        let (router, _) = app(vec![Scripted::Reply("pay yourself first".into())]);
        let response = router
            .oneshot(post_json(
                "/api/advice/stream",
                serde_json::json!({"user_id": USER, "message": "Help me with my budget"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("\"type\":\"text_delta\""));
        assert!(body.contains("\"type\":\"done\""));
    }
}
