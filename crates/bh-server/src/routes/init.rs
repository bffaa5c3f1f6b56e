//! Bootstrap endpoint: identity + repo + workspace in one idempotent call.
//!
//! `POST /v1/init` is the only unauthenticated write surface, so it is rate
//! limited per client. It always mints a fresh API key; with a `repo_origin`
//! it also ensures the repo and a workspace whose id is the agent id.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bh_core::canonical::{canonicalize_git_url, extract_repo_name};
use bh_core::names::{role_to_alias_suffix, suggest_next_name_prefix};
use bh_core::validate::{
    has_control_chars, is_valid_alias, is_valid_human_name, is_valid_project_slug, is_valid_role,
    normalize_role,
};
use bh_db::bootstrap::{bootstrap_identity, ensure_project, BootstrapArgs};
use bh_db::identity::list_agent_aliases;
use bh_db::registry;

use crate::error::{ApiError, ApiResult};
use crate::rate_limit::{enforce_init_rate_limit, ClientIp};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    #[serde(default)]
    pub project_slug: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub human_name: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_lifetime")]
    pub lifetime: String,
    #[serde(default)]
    pub custody: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub repo_origin: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub workspace_path: String,
}

fn default_agent_type() -> String {
    "agent".into()
}

fn default_lifetime() -> String {
    "ephemeral".into()
}

fn default_role() -> String {
    "agent".into()
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub status: String,
    pub created_at: String,
    pub api_key: String,
    pub project_id: String,
    pub project_slug: String,
    pub agent_id: String,
    pub repo_id: Option<String>,
    pub canonical_origin: Option<String>,
    pub workspace_id: Option<String>,
    pub alias: String,
    pub created: bool,
    pub workspace_created: bool,
    pub did: Option<String>,
    pub custody: Option<String>,
    pub lifetime: String,
}

fn validate_init(payload: &InitRequest) -> ApiResult<()> {
    if !payload.project_slug.is_empty() && !is_valid_project_slug(payload.project_slug.trim()) {
        return Err(ApiError::Unprocessable("Invalid project_slug".into()));
    }
    if let Some(alias) = payload.alias.as_deref() {
        let alias = alias.trim();
        if !alias.is_empty() && !is_valid_alias(alias) {
            return Err(ApiError::Unprocessable("Invalid alias format".into()));
        }
    }
    let human_name = payload.human_name.trim();
    if !human_name.is_empty() && !is_valid_human_name(human_name) {
        return Err(ApiError::Unprocessable("Invalid human_name format".into()));
    }
    if !matches!(payload.lifetime.as_str(), "persistent" | "ephemeral") {
        return Err(ApiError::Unprocessable(
            "lifetime must be 'persistent' or 'ephemeral'".into(),
        ));
    }
    if let Some(custody) = payload.custody.as_deref() {
        if !matches!(custody, "self" | "custodial") {
            return Err(ApiError::Unprocessable(
                "custody must be 'self' or 'custodial'".into(),
            ));
        }
    }
    if !payload.hostname.is_empty() && has_control_chars(&payload.hostname, false) {
        return Err(ApiError::Unprocessable(
            "hostname contains invalid characters (null bytes or control characters)".into(),
        ));
    }
    if !payload.workspace_path.is_empty() && has_control_chars(&payload.workspace_path, true) {
        return Err(ApiError::Unprocessable(
            "workspace_path contains invalid characters (null bytes or control characters)".into(),
        ));
    }
    Ok(())
}

pub async fn init(
    State(state): State<SharedState>,
    ClientIp(client_ip): ClientIp,
    Json(payload): Json<InitRequest>,
) -> ApiResult<Json<InitResponse>> {
    let mut conn = state.redis();
    enforce_init_rate_limit(&mut conn, &client_ip).await?;

    validate_init(&payload)?;

    let role = {
        let r = normalize_role(payload.role.trim());
        let r = if r.is_empty() { "agent".to_string() } else { r };
        if !is_valid_role(&r) {
            return Err(ApiError::Unprocessable("Invalid role format".into()));
        }
        r
    };

    let canonical_origin = match payload.repo_origin.as_deref() {
        Some(origin) => Some(
            canonicalize_git_url(origin)
                .map_err(|e| ApiError::Unprocessable(format!("Invalid repo_origin: {e}")))?,
        ),
        None => None,
    };

    // Resolve the project slug: explicit, or inferred from a registered
    // repo's canonical origin.
    let mut project_slug = payload.project_slug.trim().to_string();
    if project_slug.is_empty() {
        let Some(canonical) = canonical_origin.as_deref() else {
            return Err(ApiError::Unprocessable("project_slug is required".into()));
        };
        let matches = registry::find_repo_projects(state.db.pool(), canonical).await?;
        project_slug = matches
            .first()
            .map(|m| m.project_slug.clone())
            .ok_or_else(|| {
                ApiError::Unprocessable("project_not_found: repo not registered".into())
            })?;
    }

    // Cloud mode supplies the project id; validate it and adopt its
    // authoritative slug + tenant.
    let mut tenant_id: Option<Uuid> = None;
    let project_id_arg = match payload.project_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let project_uuid = Uuid::parse_str(raw)
                .map_err(|_| ApiError::Unprocessable("project_id must be a valid UUID".into()))?;
            let (tenant, slug) = registry::get_server_project(state.db.pool(), project_uuid)
                .await?
                .ok_or_else(|| {
                    ApiError::NotFound("project_not_found: unknown project_id".into())
                })?;
            tenant_id = tenant;
            project_slug = slug;
            Some(project_uuid)
        }
        _ => None,
    };

    // Missing alias with a repo attached: allocate `<classic>-<role>`.
    let alias = match payload.alias.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        Some(alias) => alias.to_string(),
        None => {
            if canonical_origin.is_none() {
                return Err(ApiError::Unprocessable(
                    "alias is required without repo_origin".into(),
                ));
            }
            let ensured = ensure_project(
                state.db.pool(),
                &project_slug,
                if payload.project_name.is_empty() {
                    &project_slug
                } else {
                    &payload.project_name
                },
                project_id_arg,
                tenant_id,
            )
            .await?;
            let aliases = list_agent_aliases(state.db.pool(), ensured.project_id).await?;
            let prefix = suggest_next_name_prefix(aliases.iter().map(String::as_str))
                .ok_or_else(|| ApiError::Conflict("All name prefixes are taken.".into()))?;
            format!("{prefix}-{}", role_to_alias_suffix(&role))
        }
    };

    let identity = bootstrap_identity(
        state.db.pool(),
        BootstrapArgs {
            project_slug: project_slug.clone(),
            project_name: if payload.project_name.is_empty() {
                project_slug.clone()
            } else {
                payload.project_name.clone()
            },
            project_id: project_id_arg,
            tenant_id,
            alias,
            human_name: payload.human_name.trim().to_string(),
            agent_type: payload.agent_type.clone(),
            lifetime: payload.lifetime.clone(),
            custody: payload.custody.clone(),
        },
    )
    .await?;

    let Some(canonical_origin) = canonical_origin else {
        return Ok(Json(InitResponse {
            status: "ok".into(),
            created_at: Utc::now().to_rfc3339(),
            api_key: identity.api_key,
            project_id: identity.project_id.to_string(),
            project_slug: identity.project_slug,
            agent_id: identity.agent_id.to_string(),
            repo_id: None,
            canonical_origin: None,
            workspace_id: None,
            alias: identity.alias,
            created: identity.created,
            workspace_created: false,
            did: identity.did,
            custody: identity.custody,
            lifetime: identity.lifetime,
        }));
    };

    // Mirror the project, ensure the repo, and create-or-revive the
    // workspace (workspace id = agent id).
    if project_id_arg.is_none() {
        registry::upsert_server_project(
            state.db.pool(),
            identity.project_id,
            &identity.project_slug,
            Some(identity.project_name.as_str()).filter(|n| !n.is_empty()),
        )
        .await?;
    }

    let repo_name = extract_repo_name(&canonical_origin);
    let repo_id = registry::ensure_repo(
        state.db.pool(),
        identity.project_id,
        payload.repo_origin.as_deref().unwrap_or(&canonical_origin),
        &canonical_origin,
        &repo_name,
    )
    .await?;

    let existing = registry::get_workspace_gate(state.db.pool(), identity.agent_id).await?;
    let workspace_created = match existing {
        None => {
            let upsert = registry::UpsertWorkspace {
                workspace_id: identity.agent_id,
                project_id: identity.project_id,
                repo_id,
                alias: identity.alias.clone(),
                human_name: payload.human_name.trim().to_string(),
                role: Some(role.clone()),
                hostname: Some(payload.hostname.clone()).filter(|h| !h.is_empty()),
                workspace_path: Some(payload.workspace_path.clone()).filter(|p| !p.is_empty()),
            };
            registry::upsert_workspace(state.db.pool(), &upsert).await?;
            true
        }
        Some(gate) => {
            if gate.repo_id.is_some_and(|r| r != repo_id) || gate.repo_id.is_none() {
                return Err(ApiError::Conflict(format!(
                    "workspace_repo_mismatch: alias '{}' (workspace_id={}) is already registered \
                     for another repo. Cannot initialize the same agent for repo '{}'. Choose a \
                     different alias (new agent/worktree) or initialize from the original repo.",
                    identity.alias, identity.agent_id, canonical_origin
                )));
            }
            sqlx::query(
                r#"
                UPDATE server.workspaces
                SET repo_id = $3,
                    alias = $4,
                    human_name = $5,
                    role = $6,
                    hostname = $7,
                    workspace_path = $8,
                    deleted_at = NULL,
                    updated_at = NOW()
                WHERE workspace_id = $1 AND project_id = $2
                "#,
            )
            .bind(identity.agent_id)
            .bind(identity.project_id)
            .bind(repo_id)
            .bind(&identity.alias)
            .bind(payload.human_name.trim())
            .bind(&role)
            .bind(Some(payload.hostname.as_str()).filter(|h| !h.is_empty()))
            .bind(Some(payload.workspace_path.as_str()).filter(|p| !p.is_empty()))
            .execute(state.db.pool())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
            false
        }
    };

    Ok(Json(InitResponse {
        status: "ok".into(),
        created_at: Utc::now().to_rfc3339(),
        api_key: identity.api_key,
        project_id: identity.project_id.to_string(),
        project_slug: identity.project_slug,
        agent_id: identity.agent_id.to_string(),
        repo_id: Some(repo_id.to_string()),
        canonical_origin: Some(canonical_origin),
        workspace_id: Some(identity.agent_id.to_string()),
        alias: identity.alias,
        created: identity.created,
        workspace_created,
        did: identity.did,
        custody: identity.custody,
        lifetime: identity.lifetime,
    }))
}
