//! Project status aggregation and the SSE event stream.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use bh_core::validate::{is_valid_canonical_origin, validate_workspace_id};
use bh_db::claims::claims_with_counts;
use bh_db::{escalations, registry};
use bh_events::{stream_events_multi, StreamOptions};
use bh_presence::list_agent_presences_by_workspace_ids;

use crate::auth::get_project_from_auth;
use crate::error::{ApiError, ApiResult};
use crate::internal_auth::is_public_reader;
use crate::state::{SharedState, WorkspaceIdsCacheEntry, WORKSPACE_IDS_CACHE_TTL_SECS};

pub const DEFAULT_WORKSPACE_LIMIT: i64 = 200;
pub const MAX_WORKSPACE_LIMIT: i64 = 1000;

/// Workspace ids for a project, cached for a few seconds because SSE-driven
/// dashboards poll `/status` aggressively.
async fn cached_workspace_ids(
    state: &SharedState,
    project_id: Uuid,
    limit: i64,
) -> ApiResult<Vec<Uuid>> {
    let key = (state.db.instance_id(), project_id, limit);

    if let Some(entry) = state.workspace_ids_cache.get(&key) {
        let fresh =
            entry.fetched_at.elapsed() < Duration::from_secs(WORKSPACE_IDS_CACHE_TTL_SECS);
        if fresh && entry.limit >= limit {
            return Ok(entry.workspace_ids[..entry.workspace_ids.len().min(limit as usize)].to_vec());
        }
    }

    let workspace_ids = registry::all_workspace_ids(state.db.pool(), project_id, limit).await?;
    state.workspace_ids_cache.insert(
        key,
        WorkspaceIdsCacheEntry {
            workspace_ids: workspace_ids.clone(),
            fetched_at: Instant::now(),
            limit,
        },
    );
    Ok(workspace_ids)
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub workspace: Value,
    pub agents: Vec<Value>,
    pub claims: Vec<Value>,
    pub conflicts: Vec<Value>,
    pub escalations_pending: i64,
    pub timestamp: String,
}

/// One consistent snapshot: workspaces in scope, their presence, live
/// claims with claimant counts, multi-claimant conflicts, and the pending
/// escalation count. Public readers get a redacted view.
pub async fn status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let public_reader = is_public_reader(&headers, state.settings.internal_auth_secret.as_deref());

    let project_slug = registry::project_slug(state.db.pool(), project_id)
        .await?
        .ok_or_else(|| ApiError::Internal("authenticated project not found".into()))?;

    let (workspace_ids, workspace_info): (Vec<Uuid>, Value) = if let Some(raw) = &query.workspace_id
    {
        let validated = validate_workspace_id(raw).map_err(ApiError::Unprocessable)?;
        let workspace_uuid = Uuid::parse_str(&validated)
            .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
        if !registry::workspace_exists_live(state.db.pool(), project_id, workspace_uuid).await? {
            return Err(ApiError::NotFound("Workspace not found".into()));
        }
        (
            vec![workspace_uuid],
            json!({
                "workspace_id": validated,
                "project_id": project_id.to_string(),
                "project_slug": project_slug,
            }),
        )
    } else if let Some(repo_id) = &query.repo_id {
        let repo_uuid = Uuid::parse_str(repo_id)
            .map_err(|_| ApiError::Unprocessable("Invalid repo_id format: expected UUID".into()))?;
        let ids = registry::workspace_ids_by_repo_id(
            state.db.pool(),
            project_id,
            repo_uuid,
            DEFAULT_WORKSPACE_LIMIT,
        )
        .await?;
        let info = json!({
            "repo_id": repo_id,
            "workspace_count": ids.len(),
            "project_id": project_id.to_string(),
            "project_slug": project_slug,
        });
        (ids, info)
    } else {
        let ids = cached_workspace_ids(&state, project_id, DEFAULT_WORKSPACE_LIMIT).await?;
        let info = json!({
            "project_id": project_id.to_string(),
            "project_slug": project_slug,
            "workspace_count": ids.len(),
        });
        (ids, info)
    };

    // Presence is filtered through SQL-known workspace ids: the database is
    // authoritative for existence, so an empty scope fails closed.
    let workspace_id_strings: Vec<String> = workspace_ids.iter().map(Uuid::to_string).collect();
    let presences: Vec<HashMap<String, String>> = if workspace_id_strings.is_empty() {
        Vec::new()
    } else {
        let mut conn = state.redis();
        list_agent_presences_by_workspace_ids(&mut conn, &workspace_id_strings)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "presence unavailable for status");
                Vec::new()
            })
    };

    let escalations_pending = if public_reader {
        0
    } else {
        escalations::count_pending(state.db.pool(), project_id).await?
    };

    let claim_rows = claims_with_counts(state.db.pool(), project_id, &workspace_ids).await?;

    let claims: Vec<Value> = claim_rows
        .iter()
        .map(|r| {
            json!({
                "bead_id": r.bead_id,
                "workspace_id": r.workspace_id.to_string(),
                "alias": r.alias,
                "human_name": if public_reader { "" } else { r.human_name.as_str() },
                "claimed_at": r.claimed_at.to_rfc3339(),
                "claimant_count": r.claimant_count,
                "title": r.title,
                "project_id": r.project_id.to_string(),
            })
        })
        .collect();

    // current_issue per workspace: the most recent claim (rows arrive
    // claimed_at DESC).
    let mut claims_by_workspace: HashMap<String, String> = HashMap::new();
    for r in &claim_rows {
        claims_by_workspace
            .entry(r.workspace_id.to_string())
            .or_insert_with(|| r.bead_id.clone());
    }

    let agents: Vec<Value> = presences
        .iter()
        .map(|presence| {
            let get = |k: &str| presence.get(k).filter(|v| !v.is_empty()).cloned();
            let ws_id = presence.get("workspace_id").cloned().unwrap_or_default();
            json!({
                "workspace_id": ws_id,
                "alias": presence.get("alias").cloned().unwrap_or_default(),
                "member": if public_reader { None } else { get("member_email") },
                "human_name": if public_reader { None } else { get("human_name") },
                "program": get("program"),
                "role": get("role"),
                "status": get("status").unwrap_or_else(|| "unknown".into()),
                "current_branch": get("current_branch"),
                "canonical_origin": get("canonical_origin"),
                "timezone": get("timezone"),
                "current_issue": claims_by_workspace.get(&ws_id),
                "last_seen": presence.get("last_seen"),
            })
        })
        .collect();

    // Conflicts: beads with more than one claimant.
    let mut conflict_map: HashMap<&str, Vec<Value>> = HashMap::new();
    for r in &claim_rows {
        if r.claimant_count > 1 {
            conflict_map.entry(&r.bead_id).or_default().push(json!({
                "alias": r.alias,
                "human_name": if public_reader { "" } else { r.human_name.as_str() },
                "workspace_id": r.workspace_id.to_string(),
            }));
        }
    }
    let conflicts: Vec<Value> = conflict_map
        .into_iter()
        .map(|(bead_id, claimants)| json!({"bead_id": bead_id, "claimants": claimants}))
        .collect();

    Ok(Json(StatusResponse {
        workspace: workspace_info,
        agents,
        claims,
        conflicts,
        escalations_pending,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/status/stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub event_types: Option<String>,
}

const VALID_EVENT_CATEGORIES: &[&str] = &["reservation", "message", "escalation", "bead", "chat"];

/// Long-lived SSE stream multiplexed over the scoped workspaces' channels.
///
/// Scope resolution mirrors `/status`; explicit repo/human filters that match
/// nothing are a 404 (the caller's filter is wrong), while an empty project
/// gets a keepalive-only stream so fresh dashboards can connect early.
pub async fn status_stream(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let public_reader = is_public_reader(&headers, state.settings.internal_auth_secret.as_deref());
    let limit = query
        .limit
        .unwrap_or(DEFAULT_WORKSPACE_LIMIT)
        .clamp(1, MAX_WORKSPACE_LIMIT);

    let workspace_ids: Vec<Uuid> = if let Some(raw) = &query.workspace_id {
        let validated = validate_workspace_id(raw).map_err(ApiError::Unprocessable)?;
        let workspace_uuid = Uuid::parse_str(&validated)
            .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
        if !registry::workspace_exists_live(state.db.pool(), project_id, workspace_uuid).await? {
            return Err(ApiError::NotFound("Workspace not found".into()));
        }
        vec![workspace_uuid]
    } else if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid repo format: {}",
                &repo[..repo.len().min(50)]
            )));
        }
        registry::workspace_ids_by_repo_origin(state.db.pool(), project_id, repo, limit).await?
    } else if let Some(human_name) = &query.human_name {
        registry::workspace_ids_by_human_name(state.db.pool(), project_id, human_name, limit)
            .await?
    } else {
        cached_workspace_ids(&state, project_id, limit).await?
    };

    if workspace_ids.is_empty() && (query.repo.is_some() || query.human_name.is_some()) {
        return Err(ApiError::NotFound(
            "No workspaces found for the provided filter".into(),
        ));
    }

    let mut categories: Option<HashSet<String>> = match &query.event_types {
        None => None,
        Some(raw) => {
            let set: HashSet<String> = raw
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            let invalid: Vec<&str> = set
                .iter()
                .map(String::as_str)
                .filter(|t| !VALID_EVENT_CATEGORIES.contains(t))
                .collect();
            if !invalid.is_empty() {
                return Err(ApiError::Unprocessable(format!(
                    "Invalid event types: {}. Valid types: {}",
                    invalid.join(", "),
                    VALID_EVENT_CATEGORIES.join(", ")
                )));
            }
            Some(set)
        }
    };

    // Public streams are bead-only: reservation events carry file paths and
    // message/escalation events carry private text.
    if public_reader {
        categories = Some(HashSet::from(["bead".to_string()]));
    }

    let stream = stream_events_multi(
        state.redis_client.clone(),
        workspace_ids.iter().map(Uuid::to_string).collect(),
        StreamOptions {
            categories,
            keepalive_seconds: 30,
        },
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("failed to build SSE response: {e}")))
}
