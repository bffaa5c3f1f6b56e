//! Issue upload and query endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use bh_core::jsonl::{parse_jsonl, MAX_ISSUES_COUNT, MAX_JSONL_SIZE, MAX_JSON_DEPTH};
use bh_core::pagination::{encode_cursor, validate_pagination_params};
use bh_core::validate::{
    is_valid_branch_name, is_valid_canonical_origin, validate_workspace_id,
};
use bh_db::sync::{
    self, validate_issues_from_list, IssueCursor, IssueFilter, IssueRow, SyncOutcome,
    DEFAULT_BRANCH, VALID_ISSUE_TYPES, VALID_STATUSES,
};
use bh_db::{audit, outbox};

use crate::auth::{get_project_from_auth, resolve_agent_identity};
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Upload (JSON body)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BeadsUploadRequest {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub issues: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct BeadsUploadResponse {
    pub status: String,
    pub repo: String,
    pub branch: String,
    pub issues_synced: usize,
    pub issues_added: usize,
    pub issues_updated: usize,
    pub conflicts: Vec<String>,
    pub conflicts_count: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub synced_at: String,
}

fn validate_repo_branch(repo: &str, branch: Option<&str>) -> ApiResult<String> {
    if !is_valid_canonical_origin(repo) {
        return Err(ApiError::Unprocessable(format!(
            "Invalid repo: must be canonical origin format like github.com/org/repo (got {})",
            &repo[..repo.len().min(50)]
        )));
    }
    let branch = branch.unwrap_or(DEFAULT_BRANCH);
    if !is_valid_branch_name(branch) {
        return Err(ApiError::Unprocessable(format!(
            "Invalid branch name: {}",
            &branch[..branch.len().min(50)]
        )));
    }
    Ok(branch.to_string())
}

/// Shared post-sync tail: audit + notification fan-out.
async fn finish_upload(
    state: &SharedState,
    headers: &HeaderMap,
    project_id: Uuid,
    repo: &str,
    source: &str,
    outcome: &SyncOutcome,
) -> ApiResult<(usize, usize)> {
    let audit_details = json!({
        "repo": repo,
        "branch": outcome.branch,
        "issues_synced": outcome.issues_synced,
        "issues_added": outcome.issues_added,
        "issues_updated": outcome.issues_updated,
        "source": source,
    });
    if let Err(err) = audit::record_audit(
        state.db.pool(),
        project_id,
        None,
        "beads_uploaded",
        audit_details,
    )
    .await
    {
        warn!(error = %err, "failed to write audit log for upload");
    }

    if outcome.status_changes.is_empty() {
        return Ok((0, 0));
    }
    let sender = resolve_agent_identity(state, headers).await?;
    Ok(outbox::process_outbox(
        state.db.pool(),
        state.mail.as_ref(),
        project_id,
        sender.agent_id,
        &sender.alias,
    )
    .await?)
}

/// Upload issues as a JSON array. Suited to callers that already parsed
/// their issue file.
pub async fn beads_upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<BeadsUploadRequest>,
) -> ApiResult<Json<BeadsUploadResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let branch = validate_repo_branch(&payload.repo, payload.branch.as_deref())?;

    let entries: Vec<Map<String, Value>> = payload
        .issues
        .into_iter()
        .map(|v| {
            v.as_object()
                .cloned()
                .ok_or_else(|| ApiError::Unprocessable("issues entries must be objects".into()))
        })
        .collect::<Result<_, _>>()?;
    let issues = validate_issues_from_list(entries).map_err(ApiError::Unprocessable)?;

    let outcome =
        sync::sync_issues_to_db(state.db.pool(), project_id, &payload.repo, &branch, &issues)
            .await?;
    let (sent, failed) =
        finish_upload(&state, &headers, project_id, &payload.repo, "json", &outcome).await?;

    Ok(Json(BeadsUploadResponse {
        status: if failed == 0 {
            "completed".into()
        } else {
            "completed_with_errors".into()
        },
        repo: payload.repo,
        branch: outcome.branch.clone(),
        issues_synced: outcome.issues_synced,
        issues_added: outcome.issues_added,
        issues_updated: outcome.issues_updated,
        conflicts_count: outcome.conflicts.len(),
        conflicts: outcome.conflicts,
        notifications_sent: sent,
        notifications_failed: failed,
        synced_at: outcome.synced_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Upload (raw JSONL body)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadJsonlQuery {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Upload the raw contents of an issues JSONL file. Lets shell scripts sync
/// without a JSON tool on the client.
pub async fn beads_upload_jsonl(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<UploadJsonlQuery>,
    body: String,
) -> ApiResult<Json<BeadsUploadResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;
    let branch = validate_repo_branch(&query.repo, query.branch.as_deref())?;

    if body.len() > MAX_JSONL_SIZE {
        return Err(ApiError::BadRequest(format!(
            "JSONL body too large: {} bytes (max {MAX_JSONL_SIZE})",
            body.len()
        )));
    }
    let entries = parse_jsonl(&body, MAX_JSON_DEPTH, MAX_ISSUES_COUNT)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let issues = validate_issues_from_list(entries).map_err(ApiError::Unprocessable)?;

    let outcome =
        sync::sync_issues_to_db(state.db.pool(), project_id, &query.repo, &branch, &issues)
            .await?;
    let (sent, failed) =
        finish_upload(&state, &headers, project_id, &query.repo, "jsonl", &outcome).await?;

    Ok(Json(BeadsUploadResponse {
        status: if failed == 0 {
            "completed".into()
        } else {
            "completed_with_errors".into()
        },
        repo: query.repo,
        branch: outcome.branch.clone(),
        issues_synced: outcome.issues_synced,
        issues_added: outcome.issues_added,
        issues_updated: outcome.issues_updated,
        conflicts_count: outcome.conflicts.len(),
        conflicts: outcome.conflicts,
        notifications_sent: sent,
        notifications_failed: failed,
        synced_at: outcome.synced_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/beads/issues
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IssuesQuery {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssueView {
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub title: String,
    pub status: String,
    pub priority: i32,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub labels: Vec<String>,
    pub blocked_by: Value,
    pub parent_id: Option<Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssuesResponse {
    pub issues: Vec<IssueView>,
    pub count: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

fn issue_view(row: IssueRow) -> IssueView {
    IssueView {
        bead_id: row.bead_id,
        repo: row.repo,
        branch: row.branch,
        title: row.title,
        status: row.status,
        priority: row.priority,
        issue_type: row.issue_type,
        assignee: row.assignee,
        created_by: row.created_by,
        labels: row.labels,
        blocked_by: row.blocked_by,
        parent_id: row.parent_id,
        created_at: row.created_at.map(|t| t.to_rfc3339()),
        updated_at: row.updated_at.map(|t| t.to_rfc3339()),
    }
}

/// Decode the three-field issue cursor. All fields must be present together;
/// a partial sort key is a malformed cursor.
fn decode_issue_cursor(cursor_data: &Map<String, Value>) -> ApiResult<Option<IssueCursor>> {
    let sort_time = cursor_data.get("sort_time");
    let priority = cursor_data.get("priority");
    let bead_id = cursor_data.get("bead_id");

    let present = [sort_time, priority, bead_id]
        .iter()
        .filter(|v| v.is_some_and(|v| !v.is_null()))
        .count();
    if present == 0 {
        return Ok(None);
    }
    if present != 3 {
        return Err(ApiError::Unprocessable(
            "Invalid cursor: incomplete sort key (missing sort_time, priority, or bead_id)".into(),
        ));
    }

    let sort_time = sort_time
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Unprocessable("Invalid cursor: bad timestamp".into()))?;
    let sort_time = DateTime::parse_from_rfc3339(sort_time)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid cursor: bad timestamp ({e})")))?
        .with_timezone(&Utc);
    let priority = priority
        .and_then(Value::as_i64)
        .and_then(|p| i32::try_from(p).ok())
        .ok_or_else(|| ApiError::Unprocessable("Invalid cursor: bad priority".into()))?;
    let bead_id = bead_id
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Unprocessable("Invalid cursor: bad bead_id".into()))?
        .to_string();

    Ok(Some(IssueCursor {
        sort_time,
        priority,
        bead_id,
    }))
}

/// List synced issues with filtering, search and cursor pagination.
pub async fn beads_issues(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<IssuesQuery>,
) -> ApiResult<Json<IssuesResponse>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    let (limit, cursor_data) =
        validate_pagination_params(query.limit, query.cursor.as_deref())
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid repo: {}",
                &repo[..repo.len().min(50)]
            )));
        }
    }
    if let Some(branch) = &query.branch {
        if !is_valid_branch_name(branch) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid branch name: {}",
                &branch[..branch.len().min(50)]
            )));
        }
    }
    if let Some(issue_type) = &query.issue_type {
        if !VALID_ISSUE_TYPES.contains(&issue_type.as_str()) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid issue type: {issue_type}. Must be one of: {}",
                VALID_ISSUE_TYPES.join(", ")
            )));
        }
    }

    let statuses = match &query.status {
        None => Vec::new(),
        Some(raw) => {
            let list: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            let invalid: Vec<&str> = list
                .iter()
                .map(String::as_str)
                .filter(|s| !VALID_STATUSES.contains(s))
                .collect();
            if !invalid.is_empty() {
                return Err(ApiError::Unprocessable(format!(
                    "Invalid status: {}. Must be one of: {}",
                    invalid.join(", "),
                    VALID_STATUSES.join(", ")
                )));
            }
            list
        }
    };

    let cursor = match cursor_data {
        Some(data) => decode_issue_cursor(&data)?,
        None => None,
    };

    let filter = IssueFilter {
        repo: query.repo,
        branch: query.branch,
        statuses,
        assignee: query.assignee,
        created_by: query.created_by,
        label: query.label,
        issue_type: query.issue_type,
        query: query.q,
    };

    let mut rows =
        sync::list_issues(state.db.pool(), project_id, &filter, cursor.as_ref(), limit).await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let next_cursor = if has_more {
        rows.last().map(|last| {
            let sort_time = last.updated_at.unwrap_or(last.synced_at);
            let mut fields = Map::new();
            fields.insert("sort_time".into(), json!(sort_time.to_rfc3339()));
            fields.insert("priority".into(), json!(last.priority));
            fields.insert("bead_id".into(), json!(last.bead_id));
            encode_cursor(&fields)
        })
    } else {
        None
    };

    let issues: Vec<IssueView> = rows.into_iter().map(issue_view).collect();
    Ok(Json(IssuesResponse {
        count: issues.len(),
        issues,
        has_more,
        next_cursor,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/beads/issues/{bead_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IssueLookupQuery {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssueDetail {
    #[serde(flatten)]
    pub issue: IssueView,
    pub project_id: String,
    pub description: Option<String>,
}

/// Fetch one issue. Supplying repo + branch hits the unique index; without
/// them the alphabetically first (repo, branch) match wins.
pub async fn get_issue_by_bead_id(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(bead_id): Path<String>,
    Query(query): Query<IssueLookupQuery>,
) -> ApiResult<Json<IssueDetail>> {
    let project_id = get_project_from_auth(&state, &headers).await?;

    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!("Invalid repo: {repo}")));
        }
    }
    if let Some(branch) = &query.branch {
        if !is_valid_branch_name(branch) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid branch name: {branch}"
            )));
        }
    }

    let row = sync::get_issue(
        state.db.pool(),
        project_id,
        &bead_id,
        query.repo.as_deref(),
        query.branch.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::NotFound("Issue not found".into()))?;

    let description = row.description.clone();
    Ok(Json(IssueDetail {
        issue: issue_view(row),
        project_id: project_id.to_string(),
        description,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/beads/ready
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReadyQuery {
    pub workspace_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub issues: Vec<IssueView>,
    pub count: usize,
}

/// Issues that are open with every blocker closed (blockers not yet synced
/// count as blocking).
pub async fn beads_ready(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ReadyQuery>,
) -> ApiResult<Json<ReadyResponse>> {
    validate_workspace_id(&query.workspace_id).map_err(ApiError::Unprocessable)?;

    if let Some(repo) = &query.repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid repo: {}",
                &repo[..repo.len().min(50)]
            )));
        }
    }
    if let Some(branch) = &query.branch {
        if !is_valid_branch_name(branch) {
            return Err(ApiError::Unprocessable(format!(
                "Invalid branch name: {}",
                &branch[..branch.len().min(50)]
            )));
        }
    }

    let project_id = get_project_from_auth(&state, &headers).await?;
    let limit = query.limit.unwrap_or(10).clamp(1, 200);

    let rows = sync::ready_issues(
        state.db.pool(),
        project_id,
        query.repo.as_deref(),
        query.branch.as_deref(),
        limit,
    )
    .await?;

    let issues: Vec<IssueView> = rows.into_iter().map(issue_view).collect();
    Ok(Json(ReadyResponse {
        count: issues.len(),
        issues,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn full_issue_cursor_decodes() {
        let data = cursor_map(&[
            ("sort_time", json!("2026-03-01T12:00:00+00:00")),
            ("priority", json!(1)),
            ("bead_id", json!("bd-9")),
        ]);
        let cursor = decode_issue_cursor(&data).unwrap().unwrap();
        assert_eq!(cursor.bead_id, "bd-9");
        assert_eq!(cursor.priority, 1);
    }

    #[test]
    fn partial_issue_cursor_rejected() {
        let data = cursor_map(&[("sort_time", json!("2026-03-01T12:00:00+00:00"))]);
        let err = decode_issue_cursor(&data).unwrap_err();
        assert!(err.to_string().contains("incomplete sort key"));
    }

    #[test]
    fn empty_cursor_means_first_page() {
        assert!(decode_issue_cursor(&Map::new()).unwrap().is_none());
    }

    #[test]
    fn bad_cursor_timestamp_rejected() {
        let data = cursor_map(&[
            ("sort_time", json!("not-a-time")),
            ("priority", json!(1)),
            ("bead_id", json!("bd-9")),
        ]);
        assert!(decode_issue_cursor(&data).is_err());
    }
}
