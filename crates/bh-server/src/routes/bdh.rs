//! `bdh` CLI coordination endpoints.
//!
//! The CLI wrapper calls these around every tracked issue command:
//! - `POST /v1/bdh/command` — pre-flight: is the bead free to claim?
//! - `POST /v1/bdh/sync` — upload issue state, settle claims, fan out
//!   notifications and events.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use bh_core::canonical::canonicalize_git_url;
use bh_core::jsonl::{parse_jsonl, MAX_ISSUES_COUNT, MAX_JSON_DEPTH};
use bh_core::validate::{
    is_valid_alias, is_valid_canonical_origin, is_valid_human_name, validate_workspace_id,
    INVALID_ALIAS_MESSAGE,
};
use bh_db::claims::{self, parse_command_line};
use bh_db::sync::{
    self, validate_issues_from_list, StatusChange, SyncOutcome, DEFAULT_BRANCH,
};
use bh_db::{audit, outbox, registry};
use bh_events::{publish_event, Event, EventKind};

use crate::auth::{enforce_actor_binding, get_identity_from_auth, resolve_agent_identity};
use crate::error::{ApiError, ApiResult};
use crate::routes::ensure_workspace_alive;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Shared request fields
// ---------------------------------------------------------------------------

fn validate_common(
    workspace_id: &str,
    alias: &str,
    human_name: &str,
) -> ApiResult<(Uuid, String)> {
    let workspace_id = validate_workspace_id(workspace_id).map_err(ApiError::Unprocessable)?;
    let workspace_uuid =
        Uuid::parse_str(&workspace_id).map_err(|_| ApiError::Unprocessable("Invalid workspace_id format".into()))?;
    if !is_valid_alias(alias) {
        return Err(ApiError::Unprocessable(INVALID_ALIAS_MESSAGE.into()));
    }
    let human_name = human_name.trim().to_string();
    if !human_name.is_empty() && !is_valid_human_name(&human_name) {
        return Err(ApiError::Unprocessable("Invalid human_name format".into()));
    }
    Ok((workspace_uuid, human_name))
}

// ---------------------------------------------------------------------------
// POST /v1/bdh/command
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub workspace_id: String,
    pub alias: String,
    #[serde(default)]
    pub human_name: String,
    pub repo_origin: String,
    #[serde(default)]
    pub role: Option<String>,
    pub command_line: String,
}

#[derive(Debug, Serialize)]
pub struct BeadInProgress {
    pub bead_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub human_name: String,
    pub started_at: String,
}

#[derive(Debug, Serialize, Default)]
pub struct CommandContext {
    pub messages_waiting: u32,
    pub beads_in_progress: Vec<BeadInProgress>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub approved: bool,
    pub reason: String,
    pub context: CommandContext,
}

/// Pre-flight a tracked command. A claim attempt on a bead someone else
/// holds is rejected with the holder's identity; everything else passes
/// with current claim context attached.
pub async fn command(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<CommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let identity = get_identity_from_auth(&state, &headers).await?;
    let (workspace_uuid, human_name) =
        validate_common(&payload.workspace_id, &payload.alias, &payload.human_name)?;
    enforce_actor_binding(&identity, workspace_uuid)?;

    ensure_workspace_alive(&state, identity.project_id, workspace_uuid).await?;
    registry::touch_workspace_last_seen(
        state.db.pool(),
        identity.project_id,
        workspace_uuid,
        &human_name,
        payload.role.as_deref(),
    )
    .await?;

    let in_progress = claims::list_claims_in_progress(state.db.pool(), identity.project_id).await?;
    let beads_in_progress: Vec<BeadInProgress> = in_progress
        .iter()
        .map(|c| BeadInProgress {
            bead_id: c.bead_id.clone(),
            workspace_id: c.workspace_id.to_string(),
            alias: c.alias.clone(),
            human_name: c.human_name.clone(),
            started_at: c.claimed_at.to_rfc3339(),
        })
        .collect();

    let (cmd, bead_id, status) = parse_command_line(&payload.command_line);
    if cmd.as_deref() == Some("update") && status.as_deref() == Some("in_progress") {
        if let Some(bead_id) = &bead_id {
            for claim in &beads_in_progress {
                if &claim.bead_id == bead_id && claim.workspace_id != workspace_uuid.to_string() {
                    return Ok(Json(CommandResponse {
                        approved: false,
                        reason: format!(
                            "{bead_id} is being worked on by {} ({})",
                            claim.alias, claim.human_name
                        ),
                        context: CommandContext {
                            messages_waiting: 0,
                            beads_in_progress,
                        },
                    }));
                }
            }
        }
    }

    Ok(Json(CommandResponse {
        approved: true,
        reason: String::new(),
        context: CommandContext {
            messages_waiting: 0,
            beads_in_progress,
        },
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/bdh/sync
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub workspace_id: String,
    pub alias: String,
    #[serde(default)]
    pub human_name: String,
    pub repo_origin: String,
    #[serde(default)]
    pub role: Option<String>,

    // Full sync mode
    #[serde(default)]
    pub issues_jsonl: Option<String>,

    // Incremental sync mode
    #[serde(default)]
    pub sync_mode: Option<String>,
    #[serde(default)]
    pub changed_issues: Option<String>,
    #[serde(default)]
    pub deleted_ids: Vec<String>,

    // Claim attribution (best-effort)
    #[serde(default)]
    pub command_line: Option<String>,
}

#[derive(Debug, Serialize, Default)]
pub struct SyncStats {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub synced: bool,
    pub issues_count: i64,
    pub stats: SyncStats,
    pub sync_protocol_version: u32,
    pub claim_rejected: bool,
    pub claim_rejected_reason: String,
}

/// Ingest issue state from a workspace, then settle the claim implied by the
/// command that produced it, record notification intents, drain the outbox,
/// and publish events.
pub async fn sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<SyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let identity = get_identity_from_auth(&state, &headers).await?;
    let (workspace_uuid, human_name) =
        validate_common(&payload.workspace_id, &payload.alias, &payload.human_name)?;
    enforce_actor_binding(&identity, workspace_uuid)?;
    let project_id = identity.project_id;

    ensure_workspace_alive(&state, project_id, workspace_uuid).await?;
    registry::touch_workspace_last_seen(
        state.db.pool(),
        project_id,
        workspace_uuid,
        &human_name,
        payload.role.as_deref(),
    )
    .await?;

    let canonical_origin = canonicalize_git_url(&payload.repo_origin)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid repo_origin: {e}")))?;
    if !is_valid_canonical_origin(&canonical_origin) {
        return Err(ApiError::Unprocessable("Invalid repo_origin".into()));
    }

    let mode = payload
        .sync_mode
        .as_deref()
        .unwrap_or("full")
        .trim()
        .to_ascii_lowercase();
    if !matches!(mode.as_str(), "full" | "incremental") {
        return Err(ApiError::Unprocessable(
            "sync_mode must be 'full' or 'incremental'".into(),
        ));
    }

    let mut stats = SyncStats::default();
    let mut deleted_titles: std::collections::HashMap<String, String> = Default::default();
    let mut outcome: Option<SyncOutcome> = None;

    if mode == "full" {
        let body = payload.issues_jsonl.as_deref().unwrap_or("").trim();
        if body.is_empty() {
            return Err(ApiError::Unprocessable(
                "issues_jsonl is required for full sync".into(),
            ));
        }
        let entries = parse_jsonl(body, MAX_JSON_DEPTH, MAX_ISSUES_COUNT)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let issues = validate_issues_from_list(entries).map_err(ApiError::Unprocessable)?;
        stats.received = issues.len();
        let result = sync::sync_issues_to_db(
            state.db.pool(),
            project_id,
            &canonical_origin,
            DEFAULT_BRANCH,
            &issues,
        )
        .await?;
        stats.inserted = result.issues_added;
        stats.updated = result.issues_updated;
        outcome = Some(result);
    } else {
        let has_changes = payload
            .changed_issues
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if !has_changes && payload.deleted_ids.is_empty() {
            return Err(ApiError::Unprocessable(
                "incremental sync requires changes or deletions".into(),
            ));
        }

        if has_changes {
            let body = payload.changed_issues.as_deref().unwrap_or("");
            let entries = parse_jsonl(body, MAX_JSON_DEPTH, MAX_ISSUES_COUNT)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            let issues = validate_issues_from_list(entries).map_err(ApiError::Unprocessable)?;
            stats.received = issues.len();
            let result = sync::sync_issues_to_db(
                state.db.pool(),
                project_id,
                &canonical_origin,
                DEFAULT_BRANCH,
                &issues,
            )
            .await?;
            stats.inserted = result.issues_added;
            stats.updated = result.issues_updated;
            outcome = Some(result);
        }

        if !payload.deleted_ids.is_empty() {
            // Titles are fetched before deletion so unclaim events can still
            // name the bead.
            deleted_titles =
                sync::get_bead_titles(state.db.pool(), project_id, &payload.deleted_ids).await?;
            stats.deleted = sync::delete_issues_by_id(
                state.db.pool(),
                project_id,
                &payload.deleted_ids,
                &canonical_origin,
                DEFAULT_BRANCH,
            )
            .await?;
        }
    }

    // Settle the claim implied by the command line.
    let (cmd, bead_id, status) = parse_command_line(payload.command_line.as_deref().unwrap_or(""));
    let mut claim_rejected_reason = String::new();
    let mut claim_rejected = false;

    let project_slug = registry::project_slug(state.db.pool(), project_id).await?;

    if let Some(bead_id) = &bead_id {
        let is_claim = cmd.as_deref() == Some("update") && status.as_deref() == Some("in_progress");
        let is_release = matches!(cmd.as_deref(), Some("close") | Some("delete"))
            || (cmd.as_deref() == Some("update")
                && status.as_deref().is_some_and(|s| s != "in_progress"));

        if is_claim {
            let conflict = claims::upsert_claim(
                state.db.pool(),
                project_id,
                workspace_uuid,
                &payload.alias,
                &human_name,
                bead_id,
            )
            .await?;
            match conflict {
                Some(holder) => {
                    claim_rejected = true;
                    claim_rejected_reason = format!(
                        "{bead_id} is being worked on by {} ({})",
                        holder.alias, holder.human_name
                    );
                }
                None => {
                    let title = sync::get_bead_title(state.db.pool(), project_id, bead_id).await?;
                    publish_best_effort(
                        &state,
                        Event::now(
                            workspace_uuid.to_string(),
                            EventKind::BeadClaimed {
                                bead_id: bead_id.clone(),
                                alias: payload.alias.clone(),
                                title,
                            },
                        )
                        .with_project_slug(project_slug.clone()),
                    )
                    .await;
                }
            }
        } else if is_release {
            claims::delete_claim(state.db.pool(), project_id, workspace_uuid, bead_id).await?;
            let title = sync::get_bead_title(state.db.pool(), project_id, bead_id).await?;
            publish_best_effort(
                &state,
                Event::now(
                    workspace_uuid.to_string(),
                    EventKind::BeadUnclaimed {
                        bead_id: bead_id.clone(),
                        alias: payload.alias.clone(),
                        title,
                    },
                )
                .with_project_slug(project_slug.clone()),
            )
            .await;
        }
    }

    // Deleted beads always release this workspace's claims on them.
    for bead_id in &payload.deleted_ids {
        claims::delete_claim(state.db.pool(), project_id, workspace_uuid, bead_id).await?;
        publish_best_effort(
            &state,
            Event::now(
                workspace_uuid.to_string(),
                EventKind::BeadUnclaimed {
                    bead_id: bead_id.clone(),
                    alias: payload.alias.clone(),
                    title: deleted_titles.get(bead_id).cloned(),
                },
            )
            .with_project_slug(project_slug.clone()),
        )
        .await;
    }

    // Fan out notifications for status changes (intents were recorded inside
    // the sync transaction; this drains them post-commit).
    let mut notifications_sent = 0usize;
    let mut notifications_failed = 0usize;
    if let Some(result) = &outcome {
        if !result.status_changes.is_empty() {
            let sender = resolve_agent_identity(&state, &headers).await?;
            let (sent, failed) = outbox::process_outbox(
                state.db.pool(),
                state.mail.as_ref(),
                project_id,
                sender.agent_id,
                &sender.alias,
            )
            .await?;
            notifications_sent = sent;
            notifications_failed = failed;

            publish_status_change_events(
                &state,
                workspace_uuid,
                project_slug.clone(),
                &result.status_changes,
                &payload.alias,
            )
            .await;
        }
    }

    // Audit trail is best-effort; a logging failure never fails the sync.
    let audit_details = json!({
        "repo": canonical_origin,
        "mode": mode,
        "received": stats.received,
        "inserted": stats.inserted,
        "updated": stats.updated,
        "deleted": stats.deleted,
        "notifications_sent": notifications_sent,
        "notifications_failed": notifications_failed,
    });
    if let Err(err) = audit::record_audit(
        state.db.pool(),
        project_id,
        Some(workspace_uuid),
        "bdh_sync",
        audit_details,
    )
    .await
    {
        warn!(error = %err, "failed to write audit log for bdh sync");
    }

    let issues_count =
        sync::count_issues(state.db.pool(), project_id, &canonical_origin, DEFAULT_BRANCH).await?;

    Ok(Json(SyncResponse {
        synced: true,
        issues_count,
        stats,
        sync_protocol_version: 1,
        claim_rejected,
        claim_rejected_reason,
    }))
}

/// Publish `bead.status_changed` for every transition in the batch.
pub(crate) async fn publish_status_change_events(
    state: &Arc<crate::state::AppState>,
    workspace_id: Uuid,
    project_slug: Option<String>,
    status_changes: &[StatusChange],
    alias: &str,
) {
    for change in status_changes {
        publish_best_effort(
            state,
            Event::now(
                workspace_id.to_string(),
                EventKind::BeadStatusChanged {
                    project_id: String::new(),
                    bead_id: change.bead_id.clone(),
                    repo: change.repo.clone(),
                    old_status: change.old_status.clone().unwrap_or_default(),
                    new_status: change.new_status.clone(),
                    title: change.title.clone(),
                    alias: alias.to_string(),
                },
            )
            .with_project_slug(project_slug.clone()),
        )
        .await;
    }
}

/// Event publication never fails a request; Redis trouble is a warning.
pub(crate) async fn publish_best_effort(state: &Arc<crate::state::AppState>, event: Event) {
    let mut conn = state.redis();
    if let Err(err) = publish_event(&mut conn, &event).await {
        warn!(event_type = event.event_type(), error = %err, "event publish failed");
    }
}
