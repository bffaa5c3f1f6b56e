//! Application assembly: router, health probe, and the two startup modes.
//!
//! Standalone mode creates its own Postgres pool and Redis connections and
//! fails atomically — on any error everything already opened is closed and
//! nothing is retained. Library mode adopts connections the host
//! application owns; shutdown is the host's concern.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use bh_core::Settings;
use bh_db::outbox::SqlMailStore;
use bh_db::DatabaseInfra;

use crate::error::ApiResult;
use crate::routes;
use crate::state::{AppState, SharedState};

/// Build the full router over a prepared state.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Bootstrap
        .route("/v1/init", post(routes::init::init))
        // Workspaces. Fixed-path routes are declared before the
        // `{workspace_id}` captures so "heartbeat" never parses as an id.
        .route(
            "/v1/workspaces/suggest-name-prefix",
            post(routes::workspaces::suggest_name_prefix),
        )
        .route(
            "/v1/workspaces/register",
            post(routes::workspaces::register_workspace),
        )
        .route(
            "/v1/workspaces/heartbeat",
            post(routes::workspaces::heartbeat),
        )
        .route("/v1/workspaces", get(routes::workspaces::list_workspaces))
        .route(
            "/v1/workspaces/team",
            get(routes::workspaces::list_team_workspaces),
        )
        .route(
            "/v1/workspaces/online",
            get(routes::workspaces::list_online_workspaces),
        )
        .route(
            "/v1/workspaces/{workspace_id}",
            delete(routes::workspaces::delete_workspace),
        )
        .route(
            "/v1/workspaces/{workspace_id}/restore",
            post(routes::workspaces::restore_workspace),
        )
        // bdh CLI coordination
        .route("/v1/bdh/command", post(routes::bdh::command))
        .route("/v1/bdh/sync", post(routes::bdh::sync))
        // Issues
        .route("/v1/beads/upload", post(routes::beads::beads_upload))
        .route(
            "/v1/beads/upload-jsonl",
            post(routes::beads::beads_upload_jsonl),
        )
        .route("/v1/beads/issues", get(routes::beads::beads_issues))
        .route(
            "/v1/beads/issues/{bead_id}",
            get(routes::beads::get_issue_by_bead_id),
        )
        .route("/v1/beads/ready", get(routes::beads::beads_ready))
        // Claims
        .route("/v1/claims", get(routes::claims::list_claims))
        // Subscriptions
        .route(
            "/v1/subscriptions",
            post(routes::subscriptions::subscribe).get(routes::subscriptions::list_subscriptions),
        )
        .route(
            "/v1/subscriptions/{subscription_id}",
            delete(routes::subscriptions::unsubscribe),
        )
        // Escalations
        .route(
            "/v1/escalations",
            post(routes::escalations::create_escalation).get(routes::escalations::list_escalations),
        )
        .route(
            "/v1/escalations/{escalation_id}",
            get(routes::escalations::get_escalation),
        )
        .route(
            "/v1/escalations/{escalation_id}/respond",
            post(routes::escalations::respond_escalation),
        )
        // Status + SSE
        .route("/v1/status", get(routes::status::status))
        .route("/v1/status/stream", get(routes::status::status_stream))
        // Agents
        .route("/v1/agents", get(routes::agents::list_agents))
        .route("/v1/agents/register", post(routes::agents::register_agent))
        .route(
            "/v1/agents/suggest-alias-prefix",
            post(routes::agents::suggest_alias_prefix),
        )
        .route("/v1/agents/me", delete(routes::agents::deregister_me))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Liveness: Redis `PING` and SQL `SELECT 1`, reported per-check.
async fn health(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let mut checks = serde_json::Map::new();
    let mut healthy = true;

    let mut conn = state.redis();
    match redis::cmd("PING").query_async::<String>(&mut conn).await {
        Ok(_) => {
            checks.insert("redis".into(), json!("ok"));
        }
        Err(err) => {
            checks.insert("redis".into(), json!(format!("error: {err}")));
            healthy = false;
        }
    }

    match state.db.ping().await {
        Ok(()) => {
            checks.insert("database".into(), json!("ok"));
        }
        Err(err) => {
            checks.insert("database".into(), json!(format!("error: {err}")));
            healthy = false;
        }
    }

    Ok(Json(json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "checks": checks,
    })))
}

/// Standalone mode: connect everything from settings. Initialization is
/// atomic — a failure closes whatever was opened before the error returns.
pub async fn create_state_standalone(settings: Settings) -> anyhow::Result<SharedState> {
    let redis_client = redis::Client::open(settings.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
    info!("connected to Redis");

    // On failure the pool is closed inside `connect` and the connection
    // manager is dropped with the error; nothing half-open is retained.
    let db = DatabaseInfra::connect(&settings.database_url).await?;

    let mail = Arc::new(SqlMailStore::new(db.pool().clone()));
    Ok(Arc::new(AppState::new(
        db,
        redis_conn,
        redis_client,
        settings,
        mail,
    )))
}

/// Library mode: adopt host-provided infrastructure. The host owns the pool
/// and Redis lifecycles.
pub fn create_state_with(
    db: DatabaseInfra,
    redis_conn: redis::aio::ConnectionManager,
    redis_client: redis::Client,
    settings: Settings,
) -> SharedState {
    let mail = Arc::new(SqlMailStore::new(db.pool().clone()));
    Arc::new(AppState::new(
        db,
        redis_conn,
        redis_client,
        settings,
        mail,
    ))
}

