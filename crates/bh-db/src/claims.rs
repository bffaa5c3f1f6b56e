//! Bead claims: exclusive "I'm working on this" assertions.
//!
//! At most one workspace per `(project, bead)` holds a claim. The claim
//! stores the bead's apex — the root of its parent chain, resolved once at
//! claim time and never recomputed on reads — and claiming updates the
//! workspace's focus so team views can show what everyone is driving toward.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Parent-chain walks stop here even if the data claims deeper ancestry.
const APEX_MAX_DEPTH: usize = 20;

// ---------------------------------------------------------------------------
// Command-line hints
// ---------------------------------------------------------------------------

/// Best-effort parse of a `bd` command line into (command, bead_id, status).
///
/// Recognized commands: update, close, delete, reopen. The bead id is the
/// second token unless it is a flag. `--status X` and `--status=X` are both
/// accepted (update only).
pub fn parse_command_line(command_line: &str) -> (Option<String>, Option<String>, Option<String>) {
    let parts: Vec<&str> = command_line.split_whitespace().collect();
    let Some(cmd) = parts.first() else {
        return (None, None, None);
    };
    let cmd = cmd.trim();

    let mut bead_id = None;
    let mut status = None;

    if matches!(cmd, "update" | "close" | "delete" | "reopen") {
        if let Some(candidate) = parts.get(1) {
            if !candidate.starts_with("--") {
                bead_id = Some(candidate.trim().to_string());
            }
        }
    }

    if cmd == "update" {
        for (i, part) in parts.iter().enumerate() {
            if *part == "--status" {
                if let Some(value) = parts.get(i + 1) {
                    status = Some(value.trim().to_string());
                }
                break;
            }
            if let Some(value) = part.strip_prefix("--status=") {
                status = Some(value.trim().to_string());
                break;
            }
        }
    }

    (Some(cmd.to_string()), bead_id, status)
}

// ---------------------------------------------------------------------------
// Apex resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Apex {
    pub bead_id: Option<String>,
    pub repo_name: Option<String>,
    pub branch: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ApexNode {
    bead_id: String,
    repo: String,
    branch: String,
    parent_id: Option<Value>,
}

fn parent_key(parent: &Value) -> Option<(String, String, String)> {
    let obj = parent.as_object()?;
    let repo = obj.get("repo")?.as_str()?;
    let branch = obj.get("branch")?.as_str()?;
    let bead_id = obj.get("bead_id")?.as_str()?;
    if repo.is_empty() || branch.is_empty() || bead_id.is_empty() {
        return None;
    }
    Some((repo.to_string(), branch.to_string(), bead_id.to_string()))
}

/// Walk parent links up to the root (or the depth bound) and return the apex
/// key. Unknown beads resolve to an empty apex.
pub async fn resolve_claim_apex(
    pool: &PgPool,
    project_id: Uuid,
    bead_id: &str,
) -> DbResult<Apex> {
    let root: Option<ApexNode> = sqlx::query_as(
        r#"
        SELECT bead_id, repo, branch, parent_id
        FROM beads.beads_issues
        WHERE project_id = $1 AND bead_id = $2
        ORDER BY synced_at DESC
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .bind(bead_id)
    .fetch_optional(pool)
    .await?;

    let Some(mut node) = root else {
        return Ok(Apex::default());
    };

    let mut depth = 0;
    while depth < APEX_MAX_DEPTH {
        let Some(parent) = node.parent_id.as_ref().and_then(parent_key) else {
            break;
        };
        let (repo, branch, parent_bead) = parent;

        let parent_row: Option<ApexNode> = sqlx::query_as(
            r#"
            SELECT bead_id, repo, branch, parent_id
            FROM beads.beads_issues
            WHERE project_id = $1 AND repo = $2 AND branch = $3 AND bead_id = $4
            ORDER BY synced_at DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(&repo)
        .bind(&branch)
        .bind(&parent_bead)
        .fetch_optional(pool)
        .await?;

        match parent_row {
            Some(parent_node) => {
                node = parent_node;
                depth += 1;
            }
            None => break,
        }
    }

    Ok(Apex {
        bead_id: Some(node.bead_id),
        repo_name: Some(node.repo),
        branch: Some(node.branch),
    })
}

// ---------------------------------------------------------------------------
// Claim upsert / delete
// ---------------------------------------------------------------------------

/// The current holder of a contested claim.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimHolder {
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
}

/// Attempt to claim a bead for a workspace. Returns `None` on success, or
/// the holding workspace when someone else already has it (no write in that
/// case). After commit, the workspace's focus follows the claim's apex.
pub async fn upsert_claim(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    alias: &str,
    human_name: &str,
    bead_id: &str,
) -> DbResult<Option<ClaimHolder>> {
    let apex = resolve_claim_apex(pool, project_id, bead_id).await?;

    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let existing: Option<ClaimHolder> = sqlx::query_as(
        r#"
        SELECT workspace_id, alias, human_name
        FROM server.bead_claims
        WHERE project_id = $1 AND bead_id = $2 AND workspace_id != $3
        "#,
    )
    .bind(project_id)
    .bind(bead_id)
    .bind(workspace_id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(holder) = existing {
        return Ok(Some(holder));
    }

    sqlx::query(
        r#"
        INSERT INTO server.bead_claims (
            project_id, workspace_id, alias, human_name, bead_id,
            apex_bead_id, apex_repo_name, apex_branch, claimed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (project_id, bead_id, workspace_id)
        DO UPDATE SET
            alias = EXCLUDED.alias,
            human_name = EXCLUDED.human_name,
            apex_bead_id = EXCLUDED.apex_bead_id,
            apex_repo_name = EXCLUDED.apex_repo_name,
            apex_branch = EXCLUDED.apex_branch,
            claimed_at = EXCLUDED.claimed_at
        "#,
    )
    .bind(project_id)
    .bind(workspace_id)
    .bind(alias)
    .bind(human_name)
    .bind(bead_id)
    .bind(&apex.bead_id)
    .bind(&apex.repo_name)
    .bind(&apex.branch)
    .execute(&mut *tx)
    .await?;

    tx.commit().await.map_err(DbError::from)?;

    if apex.bead_id.is_some() {
        sqlx::query(
            r#"
            UPDATE server.workspaces
            SET focus_apex_bead_id = $1,
                focus_apex_repo_name = $2,
                focus_apex_branch = $3,
                focus_updated_at = NOW(),
                updated_at = NOW()
            WHERE project_id = $4 AND workspace_id = $5
            "#,
        )
        .bind(&apex.bead_id)
        .bind(&apex.repo_name)
        .bind(&apex.branch)
        .bind(project_id)
        .bind(workspace_id)
        .execute(pool)
        .await?;
    }

    Ok(None)
}

/// Release a claim and repoint the workspace's focus at its next most recent
/// claim (or clear it). One transaction so focus never dangles.
pub async fn delete_claim(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    bead_id: &str,
) -> DbResult<()> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    sqlx::query(
        r#"
        DELETE FROM server.bead_claims
        WHERE project_id = $1 AND workspace_id = $2 AND bead_id = $3
        "#,
    )
    .bind(project_id)
    .bind(workspace_id)
    .bind(bead_id)
    .execute(&mut *tx)
    .await?;

    let next_claim: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
        r#"
        SELECT apex_bead_id, apex_repo_name, apex_branch
        FROM server.bead_claims
        WHERE project_id = $1 AND workspace_id = $2
        ORDER BY claimed_at DESC
        LIMIT 1
        "#,
    )
    .bind(project_id)
    .bind(workspace_id)
    .fetch_optional(&mut *tx)
    .await?;

    let (apex_bead, apex_repo, apex_branch) = next_claim.unwrap_or((None, None, None));
    sqlx::query(
        r#"
        UPDATE server.workspaces
        SET focus_apex_bead_id = $1,
            focus_apex_repo_name = $2,
            focus_apex_branch = $3,
            focus_updated_at = NOW(),
            updated_at = NOW()
        WHERE project_id = $4 AND workspace_id = $5
        "#,
    )
    .bind(apex_bead)
    .bind(apex_repo)
    .bind(apex_branch)
    .bind(project_id)
    .bind(workspace_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await.map_err(DbError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimRow {
    pub bead_id: String,
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub claimed_at: DateTime<Utc>,
    pub project_id: Uuid,
}

/// Cursor-paginated claim listing, newest first. Fetches `limit + 1` rows.
pub async fn list_claims(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Option<Uuid>,
    claimed_before: Option<DateTime<Utc>>,
    limit: i64,
) -> DbResult<Vec<ClaimRow>> {
    let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
        r#"
        SELECT bead_id, workspace_id, alias, human_name, claimed_at, project_id
        FROM server.bead_claims
        WHERE project_id =
        "#,
    );
    qb.push_bind(project_id);
    if let Some(ws) = workspace_id {
        qb.push(" AND workspace_id = ");
        qb.push_bind(ws);
    }
    if let Some(before) = claimed_before {
        qb.push(" AND claimed_at < ");
        qb.push_bind(before);
    }
    qb.push(" ORDER BY claimed_at DESC LIMIT ");
    qb.push_bind(limit + 1);

    let rows = qb.build_query_as::<ClaimRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// The project's in-progress beads, newest claims first, bounded.
pub async fn list_claims_in_progress(
    pool: &PgPool,
    project_id: Uuid,
) -> DbResult<Vec<ClaimRow>> {
    let rows = sqlx::query_as(
        r#"
        SELECT bead_id, workspace_id, alias, human_name, claimed_at, project_id
        FROM server.bead_claims
        WHERE project_id = $1
        ORDER BY claimed_at DESC
        LIMIT 200
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Claim row enriched with claimant counts (conflict detection) and the bead
/// title, for the status aggregator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimWithCount {
    pub bead_id: String,
    pub workspace_id: Uuid,
    pub alias: String,
    pub human_name: String,
    pub claimed_at: DateTime<Utc>,
    pub project_id: Uuid,
    pub claimant_count: i64,
    pub title: Option<String>,
}

pub async fn claims_with_counts(
    pool: &PgPool,
    project_id: Uuid,
    workspace_ids: &[Uuid],
) -> DbResult<Vec<ClaimWithCount>> {
    if workspace_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as(
        r#"
        SELECT c.bead_id, c.workspace_id, c.alias, c.human_name, c.claimed_at, c.project_id,
               counts.claimant_count, bi.title
        FROM server.bead_claims c
        JOIN (
            SELECT project_id, bead_id, COUNT(*) AS claimant_count
            FROM server.bead_claims
            GROUP BY project_id, bead_id
        ) counts ON c.project_id = counts.project_id AND c.bead_id = counts.bead_id
        LEFT JOIN LATERAL (
            SELECT title FROM beads.beads_issues
            WHERE project_id = c.project_id AND bead_id = c.bead_id
            ORDER BY synced_at DESC
            LIMIT 1
        ) bi ON true
        WHERE c.project_id = $1 AND c.workspace_id = ANY($2)
        ORDER BY c.claimed_at DESC
        "#,
    )
    .bind(project_id)
    .bind(workspace_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-workspace claim detail (with apex titles), batched for listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimDetail {
    pub workspace_id: Uuid,
    pub bead_id: String,
    pub claimed_at: DateTime<Utc>,
    pub apex_bead_id: Option<String>,
    pub apex_repo_name: Option<String>,
    pub apex_branch: Option<String>,
    pub claim_title: Option<String>,
    pub apex_title: Option<String>,
    pub apex_type: Option<String>,
}

pub async fn claims_for_workspaces(
    pool: &PgPool,
    workspace_ids: &[Uuid],
) -> DbResult<Vec<ClaimDetail>> {
    if workspace_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as(
        r#"
        SELECT
            c.workspace_id,
            c.bead_id,
            c.claimed_at,
            c.apex_bead_id,
            c.apex_repo_name,
            c.apex_branch,
            claim_issue.title AS claim_title,
            apex_issue.title AS apex_title,
            apex_issue.issue_type AS apex_type
        FROM server.bead_claims c
        LEFT JOIN LATERAL (
            SELECT title
            FROM beads.beads_issues
            WHERE project_id = c.project_id AND bead_id = c.bead_id
            ORDER BY synced_at DESC
            LIMIT 1
        ) claim_issue ON true
        LEFT JOIN LATERAL (
            SELECT title, issue_type
            FROM beads.beads_issues
            WHERE c.apex_bead_id IS NOT NULL
              AND project_id = c.project_id
              AND bead_id = c.apex_bead_id
              AND repo = c.apex_repo_name
              AND branch = c.apex_branch
            ORDER BY synced_at DESC
            LIMIT 1
        ) apex_issue ON true
        WHERE c.workspace_id = ANY($1)
        ORDER BY c.workspace_id, c.claimed_at DESC
        "#,
    )
    .bind(workspace_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_claim_commands() {
        let (cmd, bead, status) = parse_command_line("update bd-1 --status in_progress");
        assert_eq!(cmd.as_deref(), Some("update"));
        assert_eq!(bead.as_deref(), Some("bd-1"));
        assert_eq!(status.as_deref(), Some("in_progress"));
    }

    #[test]
    fn parses_equals_form() {
        let (_, bead, status) = parse_command_line("update bd-9 --status=closed");
        assert_eq!(bead.as_deref(), Some("bd-9"));
        assert_eq!(status.as_deref(), Some("closed"));
    }

    #[test]
    fn close_without_status() {
        let (cmd, bead, status) = parse_command_line("close bd-2");
        assert_eq!(cmd.as_deref(), Some("close"));
        assert_eq!(bead.as_deref(), Some("bd-2"));
        assert!(status.is_none());
    }

    #[test]
    fn flag_in_bead_position_is_skipped() {
        let (cmd, bead, _) = parse_command_line("update --status in_progress");
        assert_eq!(cmd.as_deref(), Some("update"));
        assert!(bead.is_none());
    }

    #[test]
    fn unknown_commands_carry_no_bead() {
        let (cmd, bead, status) = parse_command_line("list --all");
        assert_eq!(cmd.as_deref(), Some("list"));
        assert!(bead.is_none());
        assert!(status.is_none());
    }

    #[test]
    fn empty_command_line() {
        assert_eq!(parse_command_line("   "), (None, None, None));
    }

    #[test]
    fn parent_key_requires_all_fields() {
        let full = serde_json::json!({"repo": "r", "branch": "b", "bead_id": "x"});
        assert_eq!(
            parent_key(&full),
            Some(("r".into(), "b".into(), "x".into()))
        );
        let missing = serde_json::json!({"repo": "r", "branch": "b"});
        assert!(parent_key(&missing).is_none());
        let empty = serde_json::json!({"repo": "", "branch": "b", "bead_id": "x"});
        assert!(parent_key(&empty).is_none());
        assert!(parent_key(&serde_json::json!("bd-1")).is_none());
    }
}
