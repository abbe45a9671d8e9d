// =============================================================================
// Control surface — Axum 0.7
// =============================================================================
//
// The interface the dashboard and CLI collaborators consume. All endpoints
// live under `/api/v1/`. CORS is configured permissively for development.
//
//   GET  /api/v1/health             liveness + config version
//   GET  /api/v1/effective-config   live config document with _version
//   GET  /api/v1/last-order-intent  newest dry-run intent (optional ?symbol=)
//   POST /api/v1/run-once           single dry-run tick for one symbol
//   POST /api/v1/start              start all bots
//   POST /api/v1/stop               stop all bots
//   GET  /api/v1/status             per-bot status list
//   POST /api/v1/reset-kill-switch  requires the confirmation token
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::ConfigManager;
use crate::kill_switch::KillSwitch;
use crate::orchestrator::MultiSymbolOrchestrator;
use crate::store::Store;

/// Shared state handed to every handler.
pub struct EngineContext {
    pub cfg: Arc<ConfigManager>,
    pub store: Arc<Store>,
    pub kill_switch: Arc<KillSwitch>,
    pub orchestrator: Arc<MultiSymbolOrchestrator>,
}

/// Build the control-surface router.
pub fn router(ctx: Arc<EngineContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/effective-config", get(effective_config))
        .route("/api/v1/last-order-intent", get(last_order_intent))
        .route("/api/v1/run-once", post(run_once))
        .route("/api/v1/start", post(start))
        .route("/api/v1/stop", post(stop))
        .route("/api/v1/status", get(status))
        .route("/api/v1/reset-kill-switch", post(reset_kill_switch))
        .layer(cors)
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "config_version": ctx.cfg.version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn effective_config(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.cfg.effective_config())
}

#[derive(Deserialize)]
struct IntentQuery {
    symbol: Option<String>,
}

async fn last_order_intent(
    State(ctx): State<Arc<EngineContext>>,
    Query(q): Query<IntentQuery>,
) -> impl IntoResponse {
    match ctx.store.last_order_intent(q.symbol.as_deref()) {
        Ok(Some(intent)) => Json(serde_json::json!({ "order_intent": intent })).into_response(),
        Ok(None) => Json(serde_json::json!({ "order_intent": null })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct RunOnceRequest {
    symbol: String,
}

async fn run_once(
    State(ctx): State<Arc<EngineContext>>,
    Json(req): Json<RunOnceRequest>,
) -> impl IntoResponse {
    let Some(bot) = ctx.orchestrator.bot_for(&req.symbol) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no bot for {}", req.symbol) })),
        )
            .into_response();
    };

    info!(symbol = %req.symbol, "run-once requested");
    match bot.run_single_tick().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
        )
            .into_response(),
    }
}

async fn start(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    info!("start requested via API");
    match ctx.orchestrator.start().await {
        Ok(()) => Json(serde_json::json!({ "status": "started" })).into_response(),
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "start refused");
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
            )
                .into_response()
        }
    }
}

async fn stop(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    info!("stop requested via API");
    ctx.orchestrator.stop().await;
    Json(serde_json::json!({ "status": "stopped" }))
}

async fn status(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "kill_switch_active": ctx.kill_switch.is_active(),
        "kill_switch_reason": ctx.kill_switch.active_reason(),
        "bots": ctx.orchestrator.status(),
    }))
}

#[derive(Deserialize)]
struct ResetRequest {
    token: String,
}

async fn reset_kill_switch(
    State(ctx): State<Arc<EngineContext>>,
    Json(req): Json<ResetRequest>,
) -> impl IntoResponse {
    match ctx.kill_switch.reset(&req.token) {
        Ok(()) => {
            info!("kill switch reset via API");
            Json(serde_json::json!({ "status": "reset" })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "kill switch reset rejected");
            (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
            )
                .into_response()
        }
    }
}
