// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires the `AuthBearer` extractor.
//
// CORS is permissive; the server binds to loopback by default.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use super::auth::AuthBearer;
use super::ApiState;
use crate::hedge::aggregate::AggregateSnapshot;

// =============================================================================
// Router construction
// =============================================================================

/// Build the control API router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/hedges", get(hedges))
        .route("/api/v1/control/stop", post(control_stop))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        running: state.aggregate.is_running(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status (authenticated)
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    aggregate: AggregateSnapshot,
    open_hedges: usize,
    pending_orders: usize,
}

async fn status(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let pending_orders: usize = state.pending.lock().await.values().map(Vec::len).sum();
    Json(StatusResponse {
        aggregate: state.aggregate.snapshot(),
        open_hedges: state.hedges.read().len(),
        pending_orders,
    })
}

// =============================================================================
// Hedges (authenticated)
// =============================================================================

async fn hedges(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let views = state.hedges.read().clone();
    Json(views)
}

// =============================================================================
// Control (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    running: bool,
    message: String,
}

async fn control_stop(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let was_running = state.aggregate.is_running();
    state.aggregate.stop();
    warn!(was_running, "Trading STOPPED via API");

    let message = if was_running {
        "Trading stopped — restart the process to resume"
    } else {
        "Trading was already stopped"
    };
    Json(ControlResponse {
        running: false,
        message: message.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Instant;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use parking_lot::RwLock;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use super::*;
    use crate::hedge::aggregate::AggregateController;
    use crate::hedge::registry::{HedgePosition, HedgeRegistry, Leg};

    const TOKEN: &str = "test-admin-token";

    fn state() -> Arc<ApiState> {
        let mut registry = HedgeRegistry::new();
        let now = Instant::now();
        registry.upsert(
            "XUSDT",
            HedgePosition::opened(Leg::new(dec!(100), dec!(1), now), Leg::new(dec!(100), dec!(1), now)),
        );
        let hedges = Arc::new(RwLock::new(registry.snapshot(now)));

        let mut pending = HashMap::new();
        pending.insert("XUSDT".to_string(), vec![7_u64, 8]);

        Arc::new(ApiState::new(
            Arc::new(AggregateController::new(dec!(1000), Some(dec!(-50)), None)),
            hedges,
            Arc::new(tokio::sync::Mutex::new(pending)),
            TOKEN,
        ))
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let resp = router(state()).oneshot(get("/api/v1/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running"], true);
    }

    #[tokio::test]
    async fn status_requires_token() {
        let app = router(state());
        let resp = app.clone().oneshot(get("/api/v1/status", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app.oneshot(get("/api/v1/status", Some("wrong"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn status_reports_aggregate_counters() {
        let resp = router(state())
            .oneshot(get("/api/v1/status", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["initial_balance"], "1000");
        assert_eq!(body["max_total_loss_usdt"], "-50");
        assert_eq!(body["open_hedges"], 1);
        assert_eq!(body["pending_orders"], 2);
    }

    #[tokio::test]
    async fn hedges_lists_published_snapshot() {
        let resp = router(state())
            .oneshot(get("/api/v1/hedges", Some(TOKEN)))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body[0]["symbol"], "XUSDT");
        assert_eq!(body[0]["legs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_clears_running_flag() {
        let state = state();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/control/stop")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();

        let resp = router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.aggregate.is_running());
    }

    #[tokio::test]
    async fn empty_token_rejects_everything() {
        let base = state();
        let locked = Arc::new(ApiState::new(
            base.aggregate.clone(),
            base.hedges.clone(),
            base.pending.clone(),
            "",
        ));
        let resp = router(locked).oneshot(get("/api/v1/hedges", Some(""))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
