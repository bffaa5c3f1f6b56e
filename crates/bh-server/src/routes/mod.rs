//! HTTP route handlers, one module per resource.
//!
//! Handlers own their request/response DTOs; cross-cutting pieces (identity
//! resolution, workspace gates, alias collision) live in `auth` and here.

pub mod agents;
pub mod bdh;
pub mod beads;
pub mod claims;
pub mod escalations;
pub mod init;
pub mod status;
pub mod subscriptions;
pub mod workspaces;

use uuid::Uuid;

use bh_db::registry::{self, WorkspaceSummary};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Gate shared by workspace-scoped writes: the workspace must exist in the
/// caller's project (404) and must not be soft-deleted (410).
pub(crate) async fn ensure_workspace_alive(
    state: &AppState,
    project_id: Uuid,
    workspace_id: Uuid,
) -> ApiResult<WorkspaceSummary> {
    let summary = registry::get_workspace_in_project(state.db.pool(), project_id, workspace_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workspace not found".into()))?;
    if summary.deleted_at.is_some() {
        return Err(ApiError::Gone("Workspace was deleted".into()));
    }
    Ok(summary)
}

/// Alias collision probe across all three sources, in order: workspaces
/// table (authoritative), claim rows (covers the window before a workspace
/// is persisted), then the Redis alias index. Returns the holding workspace.
pub(crate) async fn check_alias_collision(
    state: &AppState,
    project_id: Uuid,
    workspace_id: Uuid,
    alias: &str,
) -> ApiResult<Option<String>> {
    if let Some(holder) =
        registry::alias_collision(state.db.pool(), project_id, workspace_id, alias).await?
    {
        return Ok(Some(holder.to_string()));
    }

    let mut conn = state.redis();
    match bh_presence::get_workspace_id_by_alias(&mut conn, &project_id.to_string(), alias).await {
        Ok(Some(holder)) if holder != workspace_id.to_string() => Ok(Some(holder)),
        Ok(_) => Ok(None),
        Err(err) => {
            // Presence is a cache; its unavailability never blocks SQL-backed
            // collision checking.
            tracing::warn!(error = %err, "alias index lookup failed, relying on SQL only");
            Ok(None)
        }
    }
}
