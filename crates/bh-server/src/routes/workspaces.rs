//! Workspace discovery, registration, heartbeat and lifecycle endpoints.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use bh_core::canonical::{canonicalize_git_url, extract_repo_name};
use bh_core::names::suggest_next_name_prefix;
use bh_core::pagination::{encode_cursor, validate_pagination_params};
use bh_core::validate::{
    has_control_chars, is_valid_alias, is_valid_canonical_origin, is_valid_human_name,
    is_valid_role, normalize_role, validate_workspace_id, INVALID_ALIAS_MESSAGE,
    ROLE_ERROR_MESSAGE,
};
use bh_db::claims::ClaimDetail;
use bh_db::registry::{
    self, RegisterArgs, RegisterConflict, RestoreOutcome, SoftDeleteOutcome, WorkspaceFilter,
    WorkspaceRow,
};
use bh_presence::{
    list_agent_presences, list_agent_presences_by_workspace_ids, update_agent_presence,
    PresenceUpdate,
};

use crate::auth::{
    enforce_actor_binding, get_identity_from_auth, get_project_from_auth, resolve_agent_identity,
};
use crate::error::{ApiError, ApiResult};
use crate::internal_auth::is_public_reader;
use crate::routes::check_alias_collision;
use crate::state::SharedState;

const TEAM_STATUS_DEFAULT_LIMIT: i64 = 15;
const TEAM_STATUS_MAX_LIMIT: i64 = 200;
const TEAM_STATUS_CANDIDATE_MULTIPLIER: i64 = 5;
const TEAM_STATUS_CANDIDATE_MAX: i64 = 500;

// ---------------------------------------------------------------------------
// Shared DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ClaimInfo {
    pub bead_id: String,
    pub title: Option<String>,
    pub claimed_at: String,
    pub apex_id: Option<String>,
    pub apex_title: Option<String>,
    pub apex_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceInfo {
    pub workspace_id: String,
    pub alias: String,
    pub human_name: Option<String>,
    pub project_id: Option<String>,
    pub project_slug: Option<String>,
    pub program: Option<String>,
    pub model: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub member_email: Option<String>,
    pub role: Option<String>,
    pub hostname: Option<String>,
    pub workspace_path: Option<String>,
    pub apex_id: Option<String>,
    pub apex_title: Option<String>,
    pub apex_type: Option<String>,
    pub focus_apex_id: Option<String>,
    pub focus_apex_title: Option<String>,
    pub focus_apex_type: Option<String>,
    pub focus_apex_repo_name: Option<String>,
    pub focus_apex_branch: Option<String>,
    pub focus_updated_at: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub deleted_at: Option<String>,
    pub claims: Vec<ClaimInfo>,
}

#[derive(Debug, Serialize)]
pub struct ListWorkspacesResponse {
    pub workspaces: Vec<WorkspaceInfo>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

fn to_iso(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|v| v.to_rfc3339())
}

fn claims_by_workspace(details: Vec<ClaimDetail>) -> HashMap<String, Vec<ClaimInfo>> {
    let mut map: HashMap<String, Vec<ClaimInfo>> = HashMap::new();
    for detail in details {
        map.entry(detail.workspace_id.to_string())
            .or_default()
            .push(ClaimInfo {
                bead_id: detail.bead_id,
                title: detail.claim_title,
                claimed_at: detail.claimed_at.to_rfc3339(),
                apex_id: detail.apex_bead_id,
                apex_title: detail.apex_title,
                apex_type: detail.apex_type,
            });
    }
    map
}

/// Merge a registry row with presence + claims into the response shape,
/// redacting PII for public readers.
fn build_workspace_info(
    row: &WorkspaceRow,
    presence: Option<&HashMap<String, String>>,
    claims: Vec<ClaimInfo>,
    public_reader: bool,
) -> WorkspaceInfo {
    let first_claim = claims.first();
    let apex_id = first_claim.and_then(|c| c.apex_id.clone());
    let apex_title = first_claim.and_then(|c| c.apex_title.clone());
    let apex_type = first_claim.and_then(|c| c.apex_type.clone());

    let mut role = row.role.clone();
    let mut status = "offline".to_string();
    let mut last_seen = to_iso(row.last_seen_at);
    let mut program = None;
    let mut model = None;
    let mut member_email = None;
    let mut branch = row.current_branch.clone();

    if let Some(presence) = presence {
        let get = |k: &str| presence.get(k).filter(|v| !v.is_empty()).cloned();
        program = get("program");
        model = get("model");
        member_email = get("member_email");
        branch = get("current_branch").or(branch);
        role = get("role").or(role);
        status = get("status").unwrap_or_else(|| "active".into());
        last_seen = get("last_seen").or(last_seen);
    }

    let (human_name, member_email, role, hostname, workspace_path) = if public_reader {
        (None, None, None, None, None)
    } else {
        (
            Some(row.human_name.clone()),
            member_email,
            role,
            row.hostname.clone(),
            row.workspace_path.clone(),
        )
    };

    WorkspaceInfo {
        workspace_id: row.workspace_id.to_string(),
        alias: row.alias.clone(),
        human_name,
        project_id: Some(row.project_id.to_string()),
        project_slug: Some(row.project_slug.clone()),
        program,
        model,
        repo: row.repo.clone(),
        branch,
        member_email,
        role,
        hostname,
        workspace_path,
        apex_id,
        apex_title,
        apex_type,
        focus_apex_id: row.focus_apex_bead_id.clone(),
        focus_apex_title: row.focus_apex_title.clone(),
        focus_apex_type: row.focus_apex_type.clone(),
        focus_apex_repo_name: row.focus_apex_repo_name.clone(),
        focus_apex_branch: row.focus_apex_branch.clone(),
        focus_updated_at: to_iso(row.focus_updated_at),
        status,
        last_seen,
        deleted_at: to_iso(row.deleted_at),
        claims,
    }
}

// ---------------------------------------------------------------------------
// POST /v1/workspaces/suggest-name-prefix
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SuggestNamePrefixRequest {
    pub origin_url: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestNamePrefixResponse {
    pub name_prefix: String,
    pub project_id: String,
    pub project_slug: String,
    pub repo_id: String,
    pub canonical_origin: String,
}

/// Suggest the next free classic name for a new workspace on a repo.
pub async fn suggest_name_prefix(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<SuggestNamePrefixRequest>,
) -> ApiResult<Json<SuggestNamePrefixResponse>> {
    let canonical_origin = canonicalize_git_url(&payload.origin_url)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid origin_url: {e}")))?;

    let authed = headers.contains_key("authorization") || headers.contains_key("x-bh-auth");
    let auth_project_id = if authed {
        Some(get_project_from_auth(&state, &headers).await?)
    } else {
        None
    };

    let matches = registry::find_repo_projects(state.db.pool(), &canonical_origin).await?;

    let (project_id, project_slug, repo_id) = if matches.is_empty() {
        let Some(auth_project_id) = auth_project_id else {
            return Err(ApiError::NotFound(format!(
                "Repo not registered: {canonical_origin}. Run 'bdh :init' to register."
            )));
        };
        let (_, slug) = registry::get_server_project(state.db.pool(), auth_project_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Project not found".into()))?;
        (auth_project_id, slug, String::new())
    } else if matches.len() > 1 {
        match auth_project_id {
            Some(auth_project_id) => {
                let matched = matches
                    .iter()
                    .find(|m| m.project_id == auth_project_id)
                    .ok_or_else(|| {
                        ApiError::Forbidden("Repo does not belong to your project".into())
                    })?;
                (
                    matched.project_id,
                    matched.project_slug.clone(),
                    matched.repo_id.to_string(),
                )
            }
            None => {
                let slugs: Vec<&str> =
                    matches.iter().map(|m| m.project_slug.as_str()).collect();
                return Err(ApiError::Conflict(format!(
                    "Repo exists in multiple projects: {}. Specify project with BEADHUB_PROJECT or --project.",
                    slugs.join(", ")
                )));
            }
        }
    } else {
        let only = &matches[0];
        (
            only.project_id,
            only.project_slug.clone(),
            only.repo_id.to_string(),
        )
    };

    let aliases = bh_db::identity::list_agent_aliases(state.db.pool(), project_id).await?;
    let name_prefix = suggest_next_name_prefix(aliases.iter().map(String::as_str))
        .ok_or_else(|| {
            ApiError::Conflict(
                "All name prefixes are taken. Use --alias to specify a custom alias.".into(),
            )
        })?;

    Ok(Json(SuggestNamePrefixResponse {
        name_prefix,
        project_id: project_id.to_string(),
        project_slug,
        repo_id,
        canonical_origin,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/workspaces/register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterWorkspaceRequest {
    pub repo_origin: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterWorkspaceResponse {
    pub workspace_id: String,
    pub project_id: String,
    pub project_slug: String,
    pub repo_id: String,
    pub canonical_origin: String,
    pub alias: String,
    pub human_name: String,
    pub created: bool,
}

fn validate_role_field(role: Option<String>) -> ApiResult<Option<String>> {
    match role {
        None => Ok(None),
        Some(role) => {
            if !is_valid_role(&role) {
                return Err(ApiError::Unprocessable(ROLE_ERROR_MESSAGE.into()));
            }
            Ok(Some(normalize_role(&role)))
        }
    }
}

fn validate_hostname_field(hostname: Option<String>) -> ApiResult<Option<String>> {
    if let Some(hostname) = &hostname {
        if has_control_chars(hostname, false) {
            return Err(ApiError::Unprocessable(
                "hostname contains invalid characters (null bytes or control characters)".into(),
            ));
        }
    }
    Ok(hostname)
}

fn validate_path_field(path: Option<String>) -> ApiResult<Option<String>> {
    if let Some(path) = &path {
        if has_control_chars(path, true) {
            return Err(ApiError::Unprocessable(
                "workspace_path contains invalid characters (null bytes or control characters)"
                    .into(),
            ));
        }
    }
    Ok(path)
}

/// Register a workspace for the authenticated agent. Identity comes from the
/// agent profile; the workspace id IS the agent id.
pub async fn register_workspace(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterWorkspaceRequest>,
) -> ApiResult<Json<RegisterWorkspaceResponse>> {
    let identity = resolve_agent_identity(&state, &headers).await?;
    if !is_valid_alias(&identity.alias) {
        return Err(ApiError::Internal(
            "identity store returned invalid alias format".into(),
        ));
    }
    if !identity.human_name.is_empty() && !is_valid_human_name(&identity.human_name) {
        return Err(ApiError::Internal(
            "identity store returned invalid human_name format".into(),
        ));
    }

    let role = validate_role_field(payload.role)?;
    let hostname = validate_hostname_field(payload.hostname)?;
    let workspace_path = validate_path_field(payload.workspace_path)?;

    let canonical_origin = canonicalize_git_url(&payload.repo_origin)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid repo_origin: {e}")))?;
    let repo_name = extract_repo_name(&canonical_origin);

    let args = RegisterArgs {
        project_id: identity.project_id,
        project_slug: identity.project_slug.clone(),
        project_name: Some(identity.project_name.clone()).filter(|n| !n.is_empty()),
        workspace_id: identity.agent_id,
        alias: identity.alias.clone(),
        human_name: identity.human_name.clone(),
        origin_url: payload.repo_origin.clone(),
        canonical_origin: canonical_origin.clone(),
        repo_name,
        role,
        hostname,
        workspace_path,
    };

    let result = registry::register_workspace(state.db.pool(), &args).await?;
    let result = match result {
        Ok(result) => result,
        Err(RegisterConflict::OtherProject) => {
            return Err(ApiError::Conflict(
                "Workspace already registered in another project".into(),
            ))
        }
        Err(RegisterConflict::OtherRepo) => {
            return Err(ApiError::Conflict(
                "Workspace already registered for another repo".into(),
            ))
        }
        Err(RegisterConflict::OtherAlias) => {
            return Err(ApiError::Conflict(
                "Workspace already registered with a different alias".into(),
            ))
        }
        Err(RegisterConflict::AliasTaken) => {
            return Err(ApiError::Conflict(format!(
                "Alias '{}' is already used in this project",
                identity.alias
            )))
        }
    };

    Ok(Json(RegisterWorkspaceResponse {
        workspace_id: identity.agent_id.to_string(),
        project_id: identity.project_id.to_string(),
        project_slug: identity.project_slug,
        repo_id: result.repo_id.to_string(),
        canonical_origin,
        alias: identity.alias,
        human_name: identity.human_name,
        created: result.created,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/workspaces/heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub workspace_id: String,
    pub alias: String,
    pub repo_origin: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub current_branch: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub human_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub workspace_id: String,
}

/// Refresh workspace + presence. SQL first, Redis second: if the presence
/// write fails the heartbeat still succeeds, because SQL is authoritative.
///
/// Immutability pre-checks reject mismatches before any write so a corrupted
/// client never creates partial state.
pub async fn heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let identity = get_identity_from_auth(&state, &headers).await?;
    let workspace_id = validate_workspace_id(&payload.workspace_id)
        .map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&workspace_id)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
    enforce_actor_binding(&identity, workspace_uuid)?;
    let project_id = identity.project_id;

    if !is_valid_alias(&payload.alias) {
        return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
    }
    let role = validate_role_field(payload.role)?;
    let canonical_origin = canonicalize_git_url(&payload.repo_origin)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid repo_origin: {e}")))?;

    let existing = registry::get_workspace_gate(state.db.pool(), workspace_uuid).await?;

    let repo_id = if let Some(existing) = &existing {
        if existing.deleted_at.is_some() {
            return Err(ApiError::Gone(
                "Workspace was deleted. Run 'bdh :init' to re-register.".into(),
            ));
        }
        if existing.project_id != project_id {
            return Err(ApiError::BadRequest(format!(
                "Workspace {workspace_id} does not belong to this project. \
                 This may indicate a corrupted .beadhub file. Try running 'bdh :init' again."
            )));
        }
        if existing.alias != payload.alias {
            return Err(ApiError::Conflict(format!(
                "Alias mismatch for workspace {workspace_id} (expected '{}', got '{}'). \
                 Run 'bdh :init' to re-register.",
                existing.alias, payload.alias
            )));
        }

        match existing.repo_id {
            Some(repo_id) => {
                let stored_origin =
                    registry::repo_canonical_origin(state.db.pool(), repo_id, project_id).await?;
                match stored_origin {
                    None => {
                        return Err(ApiError::Gone(
                            "Workspace repository was deleted. Run 'bdh :init' to re-register."
                                .into(),
                        ))
                    }
                    Some(stored) if stored != canonical_origin => {
                        return Err(ApiError::BadRequest(
                            "Repo mismatch: workspace is registered with a different repository. \
                             This may indicate a corrupted .beadhub file. Run 'bdh :init' again."
                                .into(),
                        ))
                    }
                    Some(_) => repo_id,
                }
            }
            None => {
                ensure_repo_for_heartbeat(&state, project_id, &payload, &canonical_origin).await?
            }
        }
    } else {
        if let Some(holder) =
            check_alias_collision(&state, project_id, workspace_uuid, &payload.alias).await?
        {
            warn!(alias = %payload.alias, holder = %holder, "heartbeat alias collision");
            return Err(ApiError::Conflict(format!(
                "Alias '{}' is already used by another workspace in this project. \
                 Please choose a different alias and run 'bdh :init' again.",
                payload.alias
            )));
        }
        ensure_repo_for_heartbeat(&state, project_id, &payload, &canonical_origin).await?
    };

    let upsert = registry::UpsertWorkspace {
        workspace_id: workspace_uuid,
        project_id,
        repo_id,
        alias: payload.alias.clone(),
        human_name: payload.human_name.clone().unwrap_or_default(),
        role: role.clone(),
        hostname: validate_hostname_field(payload.hostname.clone())?,
        workspace_path: validate_path_field(payload.workspace_path.clone())?,
    };
    match registry::upsert_workspace(state.db.pool(), &upsert).await {
        Ok(()) => {}
        Err(err) if err.is_unique_violation() => {
            return Err(ApiError::Conflict(format!(
                "Alias '{}' is already used by another workspace in this project. \
                 Please choose a different alias and run 'bdh :init' again.",
                payload.alias
            )))
        }
        Err(err) => return Err(err.into()),
    }

    if let Some(branch) = &payload.current_branch {
        registry::set_current_branch(state.db.pool(), workspace_uuid, branch).await?;
    }

    let project_slug = registry::project_slug(state.db.pool(), project_id).await?;

    let mut conn = state.redis();
    let presence = PresenceUpdate {
        workspace_id: workspace_id.clone(),
        alias: payload.alias.clone(),
        human_name: payload.human_name.clone(),
        project_id: Some(project_id.to_string()),
        project_slug,
        repo_id: Some(repo_id.to_string()),
        program: Some("bdh".into()),
        current_branch: payload.current_branch.clone(),
        role,
        canonical_origin: Some(canonical_origin),
        ttl_seconds: Some(state.settings.presence_ttl_seconds),
        ..Default::default()
    };
    if let Err(err) = update_agent_presence(&mut conn, &presence).await {
        warn!(
            workspace_id = %workspace_id,
            error = %err,
            "heartbeat SQL upsert succeeded but presence update failed"
        );
    }

    Ok(Json(HeartbeatResponse {
        ok: true,
        workspace_id,
    }))
}

async fn ensure_repo_for_heartbeat(
    state: &SharedState,
    project_id: Uuid,
    payload: &HeartbeatRequest,
    canonical_origin: &str,
) -> ApiResult<Uuid> {
    let repo_name = extract_repo_name(canonical_origin);
    Ok(registry::ensure_repo(
        state.db.pool(),
        project_id,
        &payload.repo_origin,
        canonical_origin,
        &repo_name,
    )
    .await?)
}

// ---------------------------------------------------------------------------
// DELETE /v1/workspaces/{workspace_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DeleteWorkspaceResponse {
    pub workspace_id: String,
    pub alias: String,
    pub deleted_at: String,
}

/// Soft-delete a workspace. Any workspace in the project may delete any
/// other — stale workspaces whose directories are gone cannot delete
/// themselves, so peers clean them up. Claims are released and presence
/// cleared.
pub async fn delete_workspace(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<DeleteWorkspaceResponse>> {
    let validated = validate_workspace_id(&workspace_id).map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&validated)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;

    let identity = get_identity_from_auth(&state, &headers).await?;

    let outcome =
        registry::soft_delete_workspace(state.db.pool(), identity.project_id, workspace_uuid)
            .await?;
    let (alias, deleted_at) = match outcome {
        SoftDeleteOutcome::Deleted { alias, deleted_at } => (alias, deleted_at),
        SoftDeleteOutcome::AlreadyDeleted => {
            return Err(ApiError::NotFound(format!(
                "Workspace {validated} is already deleted"
            )))
        }
        SoftDeleteOutcome::NotFound => {
            return Err(ApiError::NotFound(format!(
                "Workspace {validated} not found"
            )))
        }
    };

    let mut conn = state.redis();
    if let Err(err) = bh_presence::clear_workspace_presence(&mut conn, &[validated.clone()]).await {
        warn!(workspace_id = %validated, error = %err, "presence clear failed after soft delete");
    }

    Ok(Json(DeleteWorkspaceResponse {
        workspace_id: validated,
        alias,
        deleted_at: deleted_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/workspaces/{workspace_id}/restore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RestoreWorkspaceResponse {
    pub workspace_id: String,
    pub alias: String,
    pub restored_at: String,
}

/// Reverse a soft delete, if the alias has not been taken meanwhile.
pub async fn restore_workspace(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<RestoreWorkspaceResponse>> {
    let validated = validate_workspace_id(&workspace_id).map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&validated)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;

    let identity = get_identity_from_auth(&state, &headers).await?;
    enforce_actor_binding(&identity, workspace_uuid)?;

    let outcome =
        registry::restore_workspace(state.db.pool(), identity.project_id, workspace_uuid).await?;
    match outcome {
        RestoreOutcome::Restored { alias, restored_at } => Ok(Json(RestoreWorkspaceResponse {
            workspace_id: validated,
            alias,
            restored_at: restored_at.to_rfc3339(),
        })),
        RestoreOutcome::NotDeleted => Err(ApiError::Conflict(format!(
            "Workspace {validated} is already active (not deleted)"
        ))),
        RestoreOutcome::AliasTaken { alias } => Err(ApiError::Conflict(format!(
            "Cannot restore: alias '{alias}' is now used by another workspace"
        ))),
        RestoreOutcome::NotFound => Err(ApiError::NotFound(format!(
            "Workspace {validated} not found"
        ))),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/workspaces
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListWorkspacesQuery {
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub include_claims: bool,
    #[serde(default = "default_true")]
    pub include_presence: bool,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Cursor-paginated workspace listing with optional presence and claim
/// enrichment. Offline workspaces (no presence) report status `offline`.
pub async fn list_workspaces(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListWorkspacesQuery>,
) -> ApiResult<Json<ListWorkspacesResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let public_reader = is_public_reader(&headers, state.settings.internal_auth_secret.as_deref());

    let (limit, cursor_data) =
        validate_pagination_params(query.limit, query.cursor.as_deref())
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid repo format: {}",
                &repo[..repo.len().min(50)]
            )));
        }
    }
    if let Some(alias) = &query.alias {
        if !is_valid_alias(alias) {
            return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
        }
    }
    if let Some(hostname) = &query.hostname {
        if has_control_chars(hostname, false) {
            return Err(ApiError::Unprocessable(
                "Invalid hostname: contains null bytes or control characters".into(),
            ));
        }
    }

    let updated_before = match cursor_data.as_ref().and_then(|c| c.get("updated_at")) {
        Some(Value::String(ts)) => Some(
            DateTime::parse_from_rfc3339(ts)
                .map_err(|e| ApiError::Unprocessable(format!("Invalid cursor timestamp: {e}")))?
                .with_timezone(&Utc),
        ),
        Some(_) => {
            return Err(ApiError::Unprocessable(
                "Invalid cursor timestamp: not a string".into(),
            ))
        }
        None => None,
    };

    let filter = WorkspaceFilter {
        human_name: query.human_name.clone(),
        repo: query.repo.clone(),
        alias: query.alias.clone(),
        hostname: query.hostname.clone(),
        include_deleted: query.include_deleted,
        updated_before,
    };

    let mut rows = registry::list_workspaces(state.db.pool(), project_id, &filter, limit).await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let workspace_uuids: Vec<Uuid> = rows.iter().map(|r| r.workspace_id).collect();
    let workspace_ids: Vec<String> = workspace_uuids.iter().map(Uuid::to_string).collect();

    let mut presence_map: HashMap<String, HashMap<String, String>> = HashMap::new();
    if query.include_presence && !workspace_ids.is_empty() {
        let mut conn = state.redis();
        match list_agent_presences_by_workspace_ids(&mut conn, &workspace_ids).await {
            Ok(presences) => {
                for presence in presences {
                    if let Some(id) = presence.get("workspace_id").cloned() {
                        presence_map.insert(id, presence);
                    }
                }
            }
            Err(err) => warn!(error = %err, "presence enrichment failed, serving SQL view"),
        }
    }

    let mut claims_map = if query.include_claims {
        claims_by_workspace(
            bh_db::claims::claims_for_workspaces(state.db.pool(), &workspace_uuids).await?,
        )
    } else {
        HashMap::new()
    };

    let next_cursor = if has_more {
        rows.last().map(|last| {
            let mut fields = Map::new();
            fields.insert("updated_at".into(), json!(last.updated_at.to_rfc3339()));
            encode_cursor(&fields)
        })
    } else {
        None
    };

    let workspaces = rows
        .iter()
        .map(|row| {
            let id = row.workspace_id.to_string();
            build_workspace_info(
                row,
                presence_map.get(&id),
                claims_map.remove(&id).unwrap_or_default(),
                public_reader,
            )
        })
        .collect();

    Ok(Json(ListWorkspacesResponse {
        workspaces,
        has_more,
        next_cursor,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/workspaces/team
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TeamQuery {
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_true")]
    pub include_claims: bool,
    #[serde(default = "default_true")]
    pub include_presence: bool,
    #[serde(default = "default_true")]
    pub only_with_claims: bool,
    #[serde(default)]
    pub always_include_workspace_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Bounded team-status view: claim holders first, then recently active
/// workspaces. Optimized for the CLI/dashboard loop; no pagination.
pub async fn list_team_workspaces(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TeamQuery>,
) -> ApiResult<Json<ListWorkspacesResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let public_reader = is_public_reader(&headers, state.settings.internal_auth_secret.as_deref());

    let limit = query
        .limit
        .unwrap_or(TEAM_STATUS_DEFAULT_LIMIT)
        .clamp(1, TEAM_STATUS_MAX_LIMIT);

    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid repo format: {}",
                &repo[..repo.len().min(50)]
            )));
        }
    }

    let candidate_limit = if query.include_presence {
        (limit * TEAM_STATUS_CANDIDATE_MULTIPLIER).min(TEAM_STATUS_CANDIDATE_MAX)
    } else {
        limit
    };

    let mut rows = registry::team_workspace_candidates(
        state.db.pool(),
        project_id,
        query.human_name.as_deref(),
        query.repo.as_deref(),
        query.only_with_claims,
        candidate_limit,
    )
    .await?;

    if let Some(always_include) = &query.always_include_workspace_id {
        let validated = validate_workspace_id(always_include).map_err(ApiError::Unprocessable)?;
        let always_uuid = Uuid::parse_str(&validated)
            .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
        if !rows.iter().any(|r| r.workspace_id == always_uuid) {
            if let Some(extra) =
                registry::team_workspace_by_id(state.db.pool(), project_id, always_uuid).await?
            {
                rows.push(extra);
            }
        }
    }

    let workspace_uuids: Vec<Uuid> = rows.iter().map(|r| r.workspace_id).collect();
    let workspace_ids: Vec<String> = workspace_uuids.iter().map(Uuid::to_string).collect();

    let mut presence_map: HashMap<String, HashMap<String, String>> = HashMap::new();
    if query.include_presence && !workspace_ids.is_empty() {
        let mut conn = state.redis();
        match list_agent_presences_by_workspace_ids(&mut conn, &workspace_ids).await {
            Ok(presences) => {
                for presence in presences {
                    if let Some(id) = presence.get("workspace_id").cloned() {
                        presence_map.insert(id, presence);
                    }
                }
            }
            Err(err) => warn!(error = %err, "presence enrichment failed, serving SQL view"),
        }
    }

    let mut claims_map = if query.include_claims {
        claims_by_workspace(
            bh_db::claims::claims_for_workspaces(state.db.pool(), &workspace_uuids).await?,
        )
    } else {
        HashMap::new()
    };

    // (info, has_claims, online, last_seen, last_claimed) for the final sort.
    let mut entries: Vec<(WorkspaceInfo, bool, bool, i64, i64)> = rows
        .iter()
        .map(|row| {
            let id = row.workspace_id.to_string();
            let presence = presence_map.get(&id);
            let online = query.include_presence && presence.is_some();
            let info = build_workspace_info(
                row,
                presence,
                claims_map.remove(&id).unwrap_or_default(),
                public_reader,
            );
            let last_seen_ts = info
                .last_seen
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.timestamp())
                .unwrap_or(0);
            let last_claimed_ts = row
                .last_claimed_at
                .map(|t| t.timestamp())
                .unwrap_or(0);
            (info, row.claim_count > 0, online, last_seen_ts, last_claimed_ts)
        })
        .collect();

    entries.sort_by(|a, b| {
        (b.1, b.2, b.3, b.4)
            .cmp(&(a.1, a.2, a.3, a.4))
            .then_with(|| a.0.alias.cmp(&b.0.alias))
    });

    let workspaces: Vec<WorkspaceInfo> = entries
        .into_iter()
        .take(limit as usize)
        .map(|(info, ..)| info)
        .collect();

    Ok(Json(ListWorkspacesResponse {
        workspaces,
        has_more: false,
        next_cursor: None,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/workspaces/online
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OnlineQuery {
    #[serde(default)]
    pub human_name: Option<String>,
}

/// Presence-only view: workspaces with live heartbeats, most recent first.
pub async fn list_online_workspaces(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<OnlineQuery>,
) -> ApiResult<Json<ListWorkspacesResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let public_reader = is_public_reader(&headers, state.settings.internal_auth_secret.as_deref());
    let project_id_str = project_id.to_string();

    let mut conn = state.redis();
    let presences = list_agent_presences(&mut conn)
        .await
        .map_err(|e| ApiError::Internal(format!("presence listing failed: {e}")))?;

    let mut workspaces: Vec<WorkspaceInfo> = Vec::new();
    for presence in presences {
        let get = |k: &str| presence.get(k).filter(|v| !v.is_empty()).cloned();
        let (Some(workspace_id), Some(alias)) = (get("workspace_id"), get("alias")) else {
            continue;
        };
        if presence.get("project_id").map(String::as_str) != Some(project_id_str.as_str()) {
            continue;
        }
        if let Some(human_name) = &query.human_name {
            if presence.get("human_name") != Some(human_name) {
                continue;
            }
        }

        workspaces.push(WorkspaceInfo {
            workspace_id,
            alias,
            human_name: if public_reader { None } else { get("human_name") },
            project_id: Some(project_id_str.clone()),
            project_slug: get("project_slug"),
            program: get("program"),
            model: get("model"),
            repo: None,
            branch: get("current_branch"),
            member_email: if public_reader { None } else { get("member_email") },
            role: if public_reader { None } else { get("role") },
            hostname: None,
            workspace_path: None,
            apex_id: None,
            apex_title: None,
            apex_type: None,
            focus_apex_id: None,
            focus_apex_title: None,
            focus_apex_type: None,
            focus_apex_repo_name: None,
            focus_apex_branch: None,
            focus_updated_at: None,
            status: get("status").unwrap_or_else(|| "unknown".into()),
            last_seen: get("last_seen"),
            deleted_at: None,
            claims: Vec::new(),
        });
    }

    workspaces.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

    Ok(Json(ListWorkspacesResponse {
        workspaces,
        has_more: false,
        next_cursor: None,
    }))
}
