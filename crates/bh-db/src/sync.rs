//! Issue sync engine: idempotent ingestion of JSONL issue snapshots.
//!
//! Uploads are applied as upserts keyed on `(project, repo, branch, bead)`.
//! Optimistic concurrency: every incoming issue carries the client's
//! `updated_at`; when the stored row is strictly newer, the upsert is
//! skipped, the bead lands in `conflicts`, and the client's counter-proposal
//! is discarded — the server never merges.
//!
//! The whole batch commits in one transaction, and notification-outbox
//! intents for every status change are inserted inside that same
//! transaction. Fan-out happens strictly after commit.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::Postgres;
use sqlx::{PgPool, QueryBuilder};
use tracing::warn;
use uuid::Uuid;

use crate::outbox;
use crate::{DbError, DbResult};

/// Branch assumed when a sync does not name one.
pub const DEFAULT_BRANCH: &str = "main";

pub const VALID_STATUSES: &[&str] = &["open", "in_progress", "closed"];
pub const VALID_ISSUE_TYPES: &[&str] = &["bug", "feature", "task", "epic", "chore"];

// ---------------------------------------------------------------------------
// Issue validation
// ---------------------------------------------------------------------------

/// One validated issue from an upload.
#[derive(Debug, Clone)]
pub struct IssueInput {
    pub bead_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: i32,
    pub issue_type: String,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub labels: Vec<String>,
    pub blocked_by: Vec<Value>,
    pub parent_id: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn optional_timestamp(obj: &Map<String, Value>, key: &str) -> Result<Option<DateTime<Utc>>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| format!("invalid {key} timestamp: {s}")),
        Some(other) => Err(format!("invalid {key}: expected string, got {other}")),
    }
}

/// Validate raw JSONL entries into [`IssueInput`]s. The error string is the
/// API-facing 422 message.
pub fn validate_issues_from_list(entries: Vec<Map<String, Value>>) -> Result<Vec<IssueInput>, String> {
    let mut issues = Vec::with_capacity(entries.len());

    for (idx, obj) in entries.into_iter().enumerate() {
        let bead_id = optional_string(&obj, "id")
            .ok_or_else(|| format!("issue {} is missing a non-empty 'id'", idx + 1))?;

        let status = optional_string(&obj, "status").unwrap_or_else(|| "open".into());
        if !VALID_STATUSES.contains(&status.as_str()) {
            return Err(format!("issue '{bead_id}' has invalid status '{status}'"));
        }

        let issue_type = optional_string(&obj, "issue_type")
            .or_else(|| optional_string(&obj, "type"))
            .unwrap_or_else(|| "task".into());
        if !VALID_ISSUE_TYPES.contains(&issue_type.as_str()) {
            return Err(format!("issue '{bead_id}' has invalid type '{issue_type}'"));
        }

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => 2,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| format!("issue '{bead_id}' has invalid priority"))?,
            Some(_) => return Err(format!("issue '{bead_id}' has invalid priority")),
        };

        let labels = match obj.get("labels") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| format!("issue '{bead_id}' has non-string label"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(format!("issue '{bead_id}' has invalid labels")),
        };

        let blocked_by = match obj.get("blocked_by") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.to_vec(),
            Some(_) => return Err(format!("issue '{bead_id}' has invalid blocked_by")),
        };

        let parent_id = match obj.get("parent_id") {
            None | Some(Value::Null) => None,
            Some(v @ Value::Object(_)) => Some(v.clone()),
            Some(_) => return Err(format!("issue '{bead_id}' has invalid parent_id")),
        };

        issues.push(IssueInput {
            title: optional_string(&obj, "title").unwrap_or_default(),
            description: optional_string(&obj, "description"),
            status,
            priority,
            issue_type,
            assignee: optional_string(&obj, "assignee"),
            created_by: optional_string(&obj, "created_by"),
            labels,
            blocked_by,
            parent_id,
            created_at: optional_timestamp(&obj, "created_at")?,
            updated_at: optional_timestamp(&obj, "updated_at")?,
            bead_id,
        });
    }

    Ok(issues)
}

/// Bare-string blocker entries are shorthand for a bead in the same
/// repo/branch as the batch; upgrade them to the full key form.
fn normalize_blockers(blockers: &[Value], repo: &str, branch: &str) -> Value {
    let upgraded: Vec<Value> = blockers
        .iter()
        .map(|entry| match entry {
            Value::String(bead_id) => json!({
                "repo": repo,
                "branch": branch,
                "bead_id": bead_id,
            }),
            other => other.clone(),
        })
        .collect();
    Value::Array(upgraded)
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// A status transition detected during sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub old_status: Option<String>,
    pub new_status: String,
    pub title: Option<String>,
}

/// Result of one sync batch.
#[derive(Debug)]
pub struct SyncOutcome {
    pub branch: String,
    pub synced_at: DateTime<Utc>,
    pub issues_synced: usize,
    pub issues_added: usize,
    pub issues_updated: usize,
    pub conflicts: Vec<String>,
    pub status_changes: Vec<StatusChange>,
}

/// Apply a validated batch. Upserts, conflict detection, status-change
/// collection and outbox-intent recording all commit atomically.
pub async fn sync_issues_to_db(
    pool: &PgPool,
    project_id: Uuid,
    repo: &str,
    branch: &str,
    issues: &[IssueInput],
) -> DbResult<SyncOutcome> {
    let synced_at = Utc::now();
    let mut added = 0usize;
    let mut updated = 0usize;
    let mut conflicts: Vec<String> = Vec::new();
    let mut status_changes: Vec<StatusChange> = Vec::new();

    let mut tx = pool.begin().await.map_err(DbError::from)?;

    for issue in issues {
        let existing: Option<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT status, updated_at FROM beads.beads_issues
            WHERE project_id = $1 AND repo = $2 AND branch = $3 AND bead_id = $4
            FOR UPDATE
            "#,
        )
        .bind(project_id)
        .bind(repo)
        .bind(branch)
        .bind(&issue.bead_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((old_status, stored_updated_at)) = &existing {
            // Optimistic lock: a strictly newer row in the database wins and
            // the client's version is dropped.
            if let (Some(stored), Some(incoming)) = (stored_updated_at, &issue.updated_at) {
                if stored > incoming {
                    warn!(
                        bead_id = %issue.bead_id,
                        stored = %stored,
                        incoming = %incoming,
                        "sync conflict: database row is newer, skipping"
                    );
                    conflicts.push(issue.bead_id.clone());
                    continue;
                }
            }

            if *old_status != issue.status {
                status_changes.push(StatusChange {
                    bead_id: issue.bead_id.clone(),
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                    old_status: Some(old_status.clone()),
                    new_status: issue.status.clone(),
                    title: Some(issue.title.clone()),
                });
            }
            updated += 1;
        } else {
            added += 1;
        }

        sqlx::query(
            r#"
            INSERT INTO beads.beads_issues (
                project_id, repo, branch, bead_id, title, description, status,
                priority, issue_type, assignee, created_by, labels, blocked_by,
                parent_id, created_at, updated_at, synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (project_id, repo, branch, bead_id)
            DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                issue_type = EXCLUDED.issue_type,
                assignee = EXCLUDED.assignee,
                created_by = EXCLUDED.created_by,
                labels = EXCLUDED.labels,
                blocked_by = EXCLUDED.blocked_by,
                parent_id = EXCLUDED.parent_id,
                created_at = COALESCE(EXCLUDED.created_at, beads.beads_issues.created_at),
                updated_at = EXCLUDED.updated_at,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(project_id)
        .bind(repo)
        .bind(branch)
        .bind(&issue.bead_id)
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.status)
        .bind(issue.priority)
        .bind(&issue.issue_type)
        .bind(&issue.assignee)
        .bind(&issue.created_by)
        .bind(&issue.labels)
        .bind(normalize_blockers(&issue.blocked_by, repo, branch))
        .bind(&issue.parent_id)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .bind(synced_at)
        .execute(&mut *tx)
        .await?;
    }

    // Outbox causality: intents land in the same transaction as the bead
    // mutations; fan-out happens strictly after commit.
    outbox::record_intents_in_tx(&mut tx, project_id, &status_changes, synced_at).await?;

    tx.commit().await.map_err(DbError::from)?;

    Ok(SyncOutcome {
        branch: branch.to_string(),
        synced_at,
        issues_synced: issues.len(),
        issues_added: added,
        issues_updated: updated,
        conflicts,
        status_changes,
    })
}

/// Remove issues by id within `(project, repo, branch)`. Returns the number
/// of rows deleted.
pub async fn delete_issues_by_id(
    pool: &PgPool,
    project_id: Uuid,
    bead_ids: &[String],
    repo: &str,
    branch: &str,
) -> DbResult<u64> {
    if bead_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(
        r#"
        DELETE FROM beads.beads_issues
        WHERE project_id = $1 AND repo = $2 AND branch = $3 AND bead_id = ANY($4)
        "#,
    )
    .bind(project_id)
    .bind(repo)
    .bind(branch)
    .bind(bead_ids)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Total issues for a `(project, repo, branch)` tuple.
pub async fn count_issues(
    pool: &PgPool,
    project_id: Uuid,
    repo: &str,
    branch: &str,
) -> DbResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM beads.beads_issues
        WHERE project_id = $1 AND repo = $2 AND branch = $3
        "#,
    )
    .bind(project_id)
    .bind(repo)
    .bind(branch)
    .fetch_one(pool)
    .await
    .map_err(DbError::from)?;
    Ok(count)
}

/// Most recently synced title for a bead.
pub async fn get_bead_title(
    pool: &PgPool,
    project_id: Uuid,
    bead_id: &str,
) -> DbResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT title FROM beads.beads_issues
        WHERE project_id = $1 AND bead_id = $2
        ORDER BY synced_at DESC
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .bind(bead_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(t,)| t))
}

/// Batched title lookup, one row per bead id.
pub async fn get_bead_titles(
    pool: &PgPool,
    project_id: Uuid,
    bead_ids: &[String],
) -> DbResult<std::collections::HashMap<String, String>> {
    if bead_ids.is_empty() {
        return Ok(Default::default());
    }
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (bead_id) bead_id, title
        FROM beads.beads_issues
        WHERE project_id = $1 AND bead_id = ANY($2)
        ORDER BY bead_id, synced_at DESC
        "#,
    )
    .bind(project_id)
    .bind(bead_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IssueRow {
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: i32,
    pub issue_type: String,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub labels: Vec<String>,
    pub blocked_by: Value,
    pub parent_id: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

/// Filters for the issue listing.
#[derive(Debug, Default, Clone)]
pub struct IssueFilter {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub statuses: Vec<String>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub label: Option<String>,
    pub issue_type: Option<String>,
    /// Free-text search: bead id prefix or title substring.
    pub query: Option<String>,
}

/// Cursor position: the sort key of the last row on the previous page.
#[derive(Debug, Clone)]
pub struct IssueCursor {
    pub sort_time: DateTime<Utc>,
    pub priority: i32,
    pub bead_id: String,
}

/// Escape `%`, `_` and `\` so user input cannot act as LIKE wildcards.
fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// List issues ordered by `COALESCE(updated_at, synced_at) DESC, priority
/// ASC, bead_id ASC`, fetching `limit + 1` rows for has-more detection.
pub async fn list_issues(
    pool: &PgPool,
    project_id: Uuid,
    filter: &IssueFilter,
    cursor: Option<&IssueCursor>,
    limit: i64,
) -> DbResult<Vec<IssueRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT bead_id, repo, branch, title, description, status, priority, issue_type,
               assignee, created_by, labels, blocked_by, parent_id,
               created_at, updated_at, synced_at
        FROM beads.beads_issues
        WHERE project_id =
        "#,
    );
    qb.push_bind(project_id);

    if let Some(repo) = &filter.repo {
        qb.push(" AND repo = ");
        qb.push_bind(repo.clone());
    }
    if let Some(branch) = &filter.branch {
        qb.push(" AND branch = ");
        qb.push_bind(branch.clone());
    }
    match filter.statuses.len() {
        0 => {}
        1 => {
            qb.push(" AND status = ");
            qb.push_bind(filter.statuses[0].clone());
        }
        _ => {
            qb.push(" AND status = ANY(");
            qb.push_bind(filter.statuses.clone());
            qb.push(")");
        }
    }
    if let Some(assignee) = &filter.assignee {
        qb.push(" AND assignee = ");
        qb.push_bind(assignee.clone());
    }
    if let Some(created_by) = &filter.created_by {
        qb.push(" AND created_by = ");
        qb.push_bind(created_by.clone());
    }
    if let Some(label) = &filter.label {
        qb.push(" AND ");
        qb.push_bind(label.clone());
        qb.push(" = ANY(labels)");
    }
    if let Some(issue_type) = &filter.issue_type {
        qb.push(" AND issue_type = ");
        qb.push_bind(issue_type.clone());
    }
    if let Some(query) = &filter.query {
        let escaped = escape_like_pattern(query);
        qb.push(" AND (bead_id ILIKE ");
        qb.push_bind(format!("{escaped}%"));
        qb.push(" ESCAPE '\\' OR title ILIKE ");
        qb.push_bind(format!("%{escaped}%"));
        qb.push(" ESCAPE '\\')");
    }

    if let Some(cursor) = cursor {
        // "After" for DESC time order: strictly older, or the same instant
        // with a larger (priority, bead_id).
        qb.push(" AND (COALESCE(updated_at, synced_at) < ");
        qb.push_bind(cursor.sort_time);
        qb.push(" OR (COALESCE(updated_at, synced_at) = ");
        qb.push_bind(cursor.sort_time);
        qb.push(" AND (priority, bead_id) > (");
        qb.push_bind(cursor.priority);
        qb.push(", ");
        qb.push_bind(cursor.bead_id.clone());
        qb.push(")))");
    }

    qb.push(" ORDER BY COALESCE(updated_at, synced_at) DESC, priority ASC, bead_id ASC LIMIT ");
    qb.push_bind(limit + 1);

    let rows = qb.build_query_as::<IssueRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// Fetch a single issue. With repo+branch this is a unique-key lookup;
/// without, the alphabetically first match by (repo, branch) wins.
pub async fn get_issue(
    pool: &PgPool,
    project_id: Uuid,
    bead_id: &str,
    repo: Option<&str>,
    branch: Option<&str>,
) -> DbResult<Option<IssueRow>> {
    let row = match (repo, branch) {
        (Some(repo), Some(branch)) => {
            sqlx::query_as(
                r#"
                SELECT bead_id, repo, branch, title, description, status, priority, issue_type,
                       assignee, created_by, labels, blocked_by, parent_id,
                       created_at, updated_at, synced_at
                FROM beads.beads_issues
                WHERE project_id = $1 AND repo = $2 AND branch = $3 AND bead_id = $4
                "#,
            )
            .bind(project_id)
            .bind(repo)
            .bind(branch)
            .bind(bead_id)
            .fetch_optional(pool)
            .await?
        }
        _ => {
            sqlx::query_as(
                r#"
                SELECT bead_id, repo, branch, title, description, status, priority, issue_type,
                       assignee, created_by, labels, blocked_by, parent_id,
                       created_at, updated_at, synced_at
                FROM beads.beads_issues
                WHERE project_id = $1 AND bead_id = $2
                ORDER BY repo ASC, branch ASC
                LIMIT 1
                "#,
            )
            .bind(project_id)
            .bind(bead_id)
            .fetch_optional(pool)
            .await?
        }
    };
    Ok(row)
}

/// Issues ready to work on: open, with every blocker present in the database
/// and closed. Missing blockers block (they have not been synced yet).
pub async fn ready_issues(
    pool: &PgPool,
    project_id: Uuid,
    repo: Option<&str>,
    branch: Option<&str>,
    limit: i64,
) -> DbResult<Vec<IssueRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT i.bead_id, i.repo, i.branch, i.title, i.description, i.status, i.priority, i.issue_type,
               i.assignee, i.created_by, i.labels, i.blocked_by, i.parent_id,
               i.created_at, i.updated_at, i.synced_at
        FROM beads.beads_issues i
        WHERE i.project_id =
        "#,
    );
    qb.push_bind(project_id);
    qb.push(" AND i.status = 'open'");
    qb.push(
        r#"
        AND NOT EXISTS (
            SELECT 1
            FROM jsonb_array_elements(i.blocked_by) AS blocker
            LEFT JOIN beads.beads_issues b ON
                b.project_id = i.project_id AND
                b.repo = blocker->>'repo' AND
                b.branch = blocker->>'branch' AND
                b.bead_id = blocker->>'bead_id'
            WHERE b.bead_id IS NULL OR b.status != 'closed'
        )
        "#,
    );
    if let Some(repo) = repo {
        qb.push(" AND i.repo = ");
        qb.push_bind(repo.to_string());
    }
    if let Some(branch) = branch {
        qb.push(" AND i.branch = ");
        qb.push_bind(branch.to_string());
    }
    qb.push(" ORDER BY i.priority ASC, i.bead_id ASC LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build_query_as::<IssueRow>().fetch_all(pool).await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("test entry must be an object")
    }

    #[test]
    fn validates_minimal_issue_with_defaults() {
        let issues =
            validate_issues_from_list(vec![entry(json!({"id": "bd-1"}))]).expect("valid");
        let issue = &issues[0];
        assert_eq!(issue.bead_id, "bd-1");
        assert_eq!(issue.status, "open");
        assert_eq!(issue.priority, 2);
        assert_eq!(issue.issue_type, "task");
        assert!(issue.labels.is_empty());
    }

    #[test]
    fn rejects_missing_id() {
        let err = validate_issues_from_list(vec![entry(json!({"title": "no id"}))]).unwrap_err();
        assert!(err.contains("missing a non-empty 'id'"));
    }

    #[test]
    fn rejects_unknown_status_and_type() {
        let err =
            validate_issues_from_list(vec![entry(json!({"id": "x", "status": "paused"}))])
                .unwrap_err();
        assert!(err.contains("invalid status"));

        let err =
            validate_issues_from_list(vec![entry(json!({"id": "x", "issue_type": "saga"}))])
                .unwrap_err();
        assert!(err.contains("invalid type"));
    }

    #[test]
    fn accepts_type_alias_field() {
        let issues =
            validate_issues_from_list(vec![entry(json!({"id": "x", "type": "epic"}))]).unwrap();
        assert_eq!(issues[0].issue_type, "epic");
    }

    #[test]
    fn parses_timestamps() {
        let issues = validate_issues_from_list(vec![entry(json!({
            "id": "x",
            "updated_at": "2026-03-01T12:00:00+00:00",
        }))])
        .unwrap();
        assert!(issues[0].updated_at.is_some());

        let err = validate_issues_from_list(vec![entry(json!({
            "id": "x",
            "updated_at": "yesterday",
        }))])
        .unwrap_err();
        assert!(err.contains("invalid updated_at"));
    }

    #[test]
    fn upgrades_bare_string_blockers() {
        let normalized = normalize_blockers(
            &[json!("bd-2"), json!({"repo": "r", "branch": "b", "bead_id": "bd-3"})],
            "github.com/acme/widgets",
            "main",
        );
        let arr = normalized.as_array().unwrap();
        assert_eq!(arr[0]["repo"], "github.com/acme/widgets");
        assert_eq!(arr[0]["bead_id"], "bd-2");
        assert_eq!(arr[1]["repo"], "r");
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like_pattern("50%_done\\x"), "50\\%\\_done\\\\x");
    }
}
