//! Request authentication and workspace-scope checks.
//!
//! Every request resolves to an [`AuthIdentity`]. Priority order:
//! 1. trusted-proxy context (`X-BH-Auth`, signature-verified)
//! 2. bearer API key (`Authorization: Bearer aw_sk_…`)
//!
//! In bearer mode the token's agent IS the workspace, and workspace-scoped
//! mutations must match it (actor binding). In proxy mode the wrapper has
//! already enforced binding, so the core skips it.

use axum::http::HeaderMap;
use uuid::Uuid;

use bh_core::validate::validate_workspace_id;
use bh_db::identity::{self, AgentProfile};

use crate::error::{ApiError, ApiResult};
use crate::internal_auth::parse_internal_auth_context;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Bearer,
    Proxy,
}

#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub project_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub auth_mode: AuthMode,
}

/// Extract the bearer token from the Authorization header.
pub fn parse_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller's identity, proxy context first, bearer key second.
pub async fn get_identity_from_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<AuthIdentity> {
    let secret = state.settings.internal_auth_secret.as_deref();
    if let Some(internal) = parse_internal_auth_context(headers, secret)? {
        let principal_uuid = Uuid::parse_str(&internal.principal_id).ok();
        return Ok(AuthIdentity {
            project_id: internal.project_id,
            agent_id: Some(internal.actor_id),
            api_key_id: (internal.principal_type == "k")
                .then_some(principal_uuid)
                .flatten(),
            user_id: (internal.principal_type == "u")
                .then_some(principal_uuid)
                .flatten(),
            auth_mode: AuthMode::Proxy,
        });
    }

    let token = parse_bearer_token(headers).ok_or_else(ApiError::auth_required)?;
    let details = identity::verify_bearer_token(state.db.pool(), token)
        .await?
        .ok_or_else(ApiError::auth_required)?;

    Ok(AuthIdentity {
        project_id: details.project_id,
        agent_id: Some(details.agent_id),
        api_key_id: Some(details.api_key_id),
        user_id: None,
        auth_mode: AuthMode::Bearer,
    })
}

/// Resolve the authenticated project id only.
pub async fn get_project_from_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<Uuid> {
    Ok(get_identity_from_auth(state, headers).await?.project_id)
}

/// Resolve the caller's full agent profile (alias, names, lifetime). Bearer
/// only: proxy principals are not agents.
pub async fn resolve_agent_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<AgentProfile> {
    let token = parse_bearer_token(headers).ok_or_else(ApiError::auth_required)?;
    let details = identity::verify_bearer_token(state.db.pool(), token)
        .await?
        .ok_or_else(ApiError::auth_required)?;

    identity::load_agent_profile(state.db.pool(), details.project_id, details.agent_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid API key".into()))
}

/// In bearer mode a key may only mutate its own workspace.
pub fn enforce_actor_binding(identity: &AuthIdentity, workspace_id: Uuid) -> ApiResult<()> {
    if identity.auth_mode == AuthMode::Bearer {
        if let Some(agent_id) = identity.agent_id {
            if agent_id != workspace_id {
                return Err(ApiError::Forbidden(
                    "workspace_id does not match API key identity".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Validate a workspace id, authenticate, and verify the workspace belongs
/// to the caller's project. Existence checks run before actor binding so
/// ghost workspaces still surface as 404/410.
pub async fn verify_workspace_access(
    state: &AppState,
    headers: &HeaderMap,
    workspace_id: &str,
) -> ApiResult<(Uuid, Uuid)> {
    let workspace_id = validate_workspace_id(workspace_id).map_err(ApiError::Unprocessable)?;
    let workspace_uuid = Uuid::parse_str(&workspace_id)
        .map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;

    let identity = get_identity_from_auth(state, headers).await?;

    let gate = bh_db::registry::get_workspace_gate(state.db.pool(), workspace_uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workspace not found".into()))?;
    if gate.deleted_at.is_some() {
        return Err(ApiError::Gone("Workspace was deleted".into()));
    }
    if gate.project_id != identity.project_id {
        return Err(ApiError::Forbidden(
            "Workspace not found or does not belong to your project".into(),
        ));
    }

    enforce_actor_binding(&identity, workspace_uuid)?;
    Ok((identity.project_id, workspace_uuid))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn identity(mode: AuthMode, agent: Uuid) -> AuthIdentity {
        AuthIdentity {
            project_id: Uuid::new_v4(),
            agent_id: Some(agent),
            api_key_id: None,
            user_id: None,
            auth_mode: mode,
        }
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer aw_sk_abc123"),
        );
        assert_eq!(parse_bearer_token(&headers), Some("aw_sk_abc123"));

        headers.insert("authorization", HeaderValue::from_static("Basic Zm9v"));
        assert_eq!(parse_bearer_token(&headers), None);

        assert_eq!(parse_bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn actor_binding_bearer_mismatch_forbidden() {
        let agent = Uuid::new_v4();
        let other = Uuid::new_v4();
        let err = enforce_actor_binding(&identity(AuthMode::Bearer, agent), other).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert!(err.to_string().contains("does not match API key identity"));
    }

    #[test]
    fn actor_binding_bearer_match_allowed() {
        let agent = Uuid::new_v4();
        assert!(enforce_actor_binding(&identity(AuthMode::Bearer, agent), agent).is_ok());
    }

    #[test]
    fn actor_binding_skipped_in_proxy_mode() {
        let agent = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(enforce_actor_binding(&identity(AuthMode::Proxy, agent), other).is_ok());
    }
}
