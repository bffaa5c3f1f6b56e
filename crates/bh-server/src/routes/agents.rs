//! Agent identity endpoints: listing, presence registration, alias
//! suggestions, and self-deregistration with its cascade.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use bh_core::names::suggest_next_name_prefix;
use bh_core::validate::{
    is_valid_project_slug, is_valid_role, normalize_role, ROLE_ERROR_MESSAGE,
};
use bh_db::identity;
use bh_presence::{list_agent_presences_by_workspace_ids, update_agent_presence, PresenceUpdate};

use crate::auth::{get_project_from_auth, resolve_agent_identity, verify_workspace_access};
use crate::error::{ApiError, ApiResult};
use crate::mutation_hooks::MutationHook;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// GET /v1/agents
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub alias: String,
    pub human_name: Option<String>,
    pub agent_type: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub online: bool,
    pub did: Option<String>,
    pub custody: Option<String>,
    pub lifetime: String,
    pub identity_status: String,
    pub access_mode: String,
}

#[derive(Debug, Serialize)]
pub struct ListAgentsResponse {
    pub project_id: String,
    pub agents: Vec<AgentView>,
}

/// List the project's agents with best-effort presence enrichment.
pub async fn list_agents(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<ListAgentsResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    let rows = identity::list_agents(state.db.pool(), project_id).await?;
    let agent_ids: Vec<String> = rows.iter().map(|r| r.agent_id.to_string()).collect();

    let mut conn = state.redis();
    let presences = list_agent_presences_by_workspace_ids(&mut conn, &agent_ids)
        .await
        .unwrap_or_default();
    let presence_by_id: std::collections::HashMap<String, _> = presences
        .into_iter()
        .filter_map(|p| p.get("workspace_id").cloned().map(|id| (id, p)))
        .collect();

    let project_id_str = project_id.to_string();
    let agents = rows
        .into_iter()
        .map(|r| {
            let agent_id = r.agent_id.to_string();
            let presence = presence_by_id
                .get(&agent_id)
                .filter(|p| p.get("project_id") == Some(&project_id_str));
            let online = presence.is_some();
            let (status, last_seen) = match presence {
                Some(p) => (
                    p.get("status")
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .unwrap_or_else(|| "active".into()),
                    p.get("last_seen").cloned(),
                ),
                None => ("offline".into(), None),
            };
            AgentView {
                agent_id,
                alias: r.alias,
                human_name: Some(r.human_name).filter(|n| !n.is_empty()),
                agent_type: Some(r.agent_type).filter(|t| !t.is_empty()),
                status,
                last_seen,
                online,
                did: r.did,
                custody: r.custody,
                lifetime: r.lifetime,
                identity_status: r.status,
                access_mode: r.access_mode,
            }
        })
        .collect();

    Ok(Json(ListAgentsResponse {
        project_id: project_id_str,
        agents,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/agents/register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent: serde_json::Value,
    pub workspace: serde_json::Value,
}

/// Record presence for an existing workspace. Presence is a cache of SQL:
/// the workspace must already exist and be accessible.
pub async fn register_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterAgentRequest>,
) -> ApiResult<Json<RegisterAgentResponse>> {
    let role = match payload.role {
        None => None,
        Some(role) => {
            if !is_valid_role(&role) {
                return Err(ApiError::Unprocessable(ROLE_ERROR_MESSAGE.into()));
            }
            Some(normalize_role(&role))
        }
    };
    if let Some(ttl) = payload.ttl_seconds {
        if ttl == 0 || ttl > 86_400 {
            return Err(ApiError::Unprocessable(
                "ttl_seconds must be between 1 and 86400".into(),
            ));
        }
    }

    let (project_id, workspace_uuid) =
        verify_workspace_access(&state, &headers, &payload.workspace_id).await?;

    // Trust the stored workspace row, not client-supplied identifiers, for
    // the indexed presence fields.
    let row: Option<(String, String, Option<String>, Option<Uuid>, String)> = sqlx::query_as(
        r#"
        SELECT w.alias, w.human_name, w.role, w.repo_id, p.slug
        FROM server.workspaces w
        JOIN server.projects p ON p.id = w.project_id AND p.deleted_at IS NULL
        WHERE w.workspace_id = $1 AND w.deleted_at IS NULL
        "#,
    )
    .bind(workspace_uuid)
    .fetch_optional(state.db.pool())
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    let Some((alias, stored_human_name, stored_role, repo_id, project_slug)) = row else {
        return Err(ApiError::Unprocessable("Workspace not found".into()));
    };

    let human_name = payload
        .human_name
        .clone()
        .or(Some(stored_human_name).filter(|n| !n.is_empty()));
    let role = role.or(stored_role);

    let mut conn = state.redis();
    let registered_at = update_agent_presence(
        &mut conn,
        &PresenceUpdate {
            workspace_id: workspace_uuid.to_string(),
            alias: alias.clone(),
            human_name: human_name.clone(),
            project_id: Some(project_id.to_string()),
            project_slug: Some(project_slug.clone()),
            repo_id: repo_id.map(|r| r.to_string()),
            program: payload.program.clone(),
            model: payload.model.clone(),
            current_branch: payload.branch.clone(),
            role: role.clone(),
            timezone: payload.timezone.clone(),
            ttl_seconds: Some(
                payload
                    .ttl_seconds
                    .unwrap_or(state.settings.presence_ttl_seconds),
            ),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| ApiError::Internal(format!("presence update failed: {e}")))?;

    Ok(Json(RegisterAgentResponse {
        agent: json!({
            "alias": alias,
            "human_name": human_name,
            "project_slug": project_slug,
            "program": payload.program,
            "model": payload.model,
            "branch": payload.branch,
            "role": role,
            "registered_at": registered_at,
        }),
        workspace: json!({ "workspace_id": workspace_uuid.to_string() }),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/agents/suggest-alias-prefix
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SuggestAliasPrefixRequest {
    pub project_slug: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestAliasPrefixResponse {
    pub project_slug: String,
    pub project_id: Option<String>,
    pub name_prefix: String,
}

/// Suggest the next free classic name for a project. Deliberately
/// unauthenticated so new agents can bootstrap cleanly.
pub async fn suggest_alias_prefix(
    State(state): State<SharedState>,
    Json(payload): Json<SuggestAliasPrefixRequest>,
) -> ApiResult<Json<SuggestAliasPrefixResponse>> {
    let slug = payload.project_slug.trim().to_string();
    if !is_valid_project_slug(&slug) {
        return Err(ApiError::Unprocessable("Invalid project_slug".into()));
    }

    let Some((project_id, slug)) = identity::find_project_by_slug(state.db.pool(), &slug).await?
    else {
        // Unknown project: the first classic name is always free.
        return Ok(Json(SuggestAliasPrefixResponse {
            project_slug: slug,
            project_id: None,
            name_prefix: "alice".into(),
        }));
    };

    let aliases = identity::list_agent_aliases(state.db.pool(), project_id).await?;
    let name_prefix = suggest_next_name_prefix(aliases.iter().map(String::as_str))
        .ok_or_else(|| ApiError::Conflict("alias_exhausted".into()))?;

    Ok(Json(SuggestAliasPrefixResponse {
        project_slug: slug,
        project_id: Some(project_id.to_string()),
        name_prefix,
    }))
}

// ---------------------------------------------------------------------------
// DELETE /v1/agents/me
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DeregisterResponse {
    pub agent_id: String,
    pub deregistered: bool,
}

/// Deregister the calling agent. The mutation hook cascades: the matching
/// workspace is soft-deleted, its claims released, its presence cleared —
/// all within this handler invocation.
pub async fn deregister_me(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<DeregisterResponse>> {
    let profile = resolve_agent_identity(&state, &headers).await?;

    let deregistered =
        identity::deregister_agent(state.db.pool(), profile.project_id, profile.agent_id).await?;
    if !deregistered {
        return Err(ApiError::NotFound("Agent not found".into()));
    }

    let hook = MutationHook::new(state.db.clone(), state.redis());
    hook.on_mutation(
        "agent.deregistered",
        &json!({
            "agent_id": profile.agent_id.to_string(),
            "project_id": profile.project_id.to_string(),
        }),
    )
    .await;

    Ok(Json(DeregisterResponse {
        agent_id: profile.agent_id.to_string(),
        deregistered: true,
    }))
}
