//! Escalations: questions an agent raises for a human to answer.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::DbResult;

pub const VALID_ESCALATION_STATUSES: &[&str] = &["pending", "responded", "expired"];

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EscalationRow {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub alias: String,
    pub member_email: Option<String>,
    pub subject: String,
    pub situation: String,
    pub options: Option<Value>,
    pub status: String,
    pub response: Option<String>,
    pub response_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateEscalation {
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub alias: String,
    pub member_email: Option<String>,
    pub subject: String,
    pub situation: String,
    pub options: Option<Value>,
    pub expires_in_hours: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreatedEscalation {
    pub id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_escalation(
    pool: &PgPool,
    esc: &CreateEscalation,
) -> DbResult<CreatedEscalation> {
    let now = Utc::now();
    let expires_at = now + Duration::hours(esc.expires_in_hours);
    let row = sqlx::query_as(
        r#"
        INSERT INTO server.escalations (
            project_id, workspace_id, alias, member_email, subject, situation,
            options, status, created_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9)
        RETURNING id, status, created_at, expires_at
        "#,
    )
    .bind(esc.project_id)
    .bind(esc.workspace_id)
    .bind(&esc.alias)
    .bind(&esc.member_email)
    .bind(&esc.subject)
    .bind(&esc.situation)
    .bind(&esc.options)
    .bind(now)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EscalationSummaryRow {
    pub id: Uuid,
    pub alias: String,
    pub subject: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct EscalationFilter {
    pub workspace_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub status: Option<String>,
    pub alias: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Cursor-paginated listing, newest first; fetches `limit + 1` rows.
pub async fn list_escalations(
    pool: &PgPool,
    project_id: Uuid,
    filter: &EscalationFilter,
    limit: i64,
) -> DbResult<Vec<EscalationSummaryRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT id, alias, subject, status, created_at, expires_at
        FROM server.escalations
        WHERE project_id =
        "#,
    );
    qb.push_bind(project_id);

    if let Some(workspace_id) = filter.workspace_id {
        qb.push(" AND workspace_id = ");
        qb.push_bind(workspace_id);
    } else if let Some(repo_id) = filter.repo_id {
        qb.push(
            " AND workspace_id IN (SELECT workspace_id FROM server.workspaces WHERE project_id = ",
        );
        qb.push_bind(project_id);
        qb.push(" AND repo_id = ");
        qb.push_bind(repo_id);
        qb.push(" AND deleted_at IS NULL)");
    }
    if let Some(status) = &filter.status {
        qb.push(" AND status = ");
        qb.push_bind(status.clone());
    }
    if let Some(alias) = &filter.alias {
        qb.push(" AND alias = ");
        qb.push_bind(alias.clone());
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at < ");
        qb.push_bind(before);
    }

    qb.push(" ORDER BY created_at DESC LIMIT ");
    qb.push_bind(limit + 1);

    let rows = qb
        .build_query_as::<EscalationSummaryRow>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Fetch one escalation; the join keeps escalations of deleted workspaces
/// out of view.
pub async fn get_escalation(
    pool: &PgPool,
    project_id: Uuid,
    escalation_id: Uuid,
    workspace_id: Option<Uuid>,
) -> DbResult<Option<EscalationRow>> {
    let row = sqlx::query_as(
        r#"
        SELECT e.id, e.workspace_id, e.alias, e.member_email, e.subject, e.situation,
               e.options, e.status, e.response, e.response_note,
               e.created_at, e.responded_at, e.expires_at
        FROM server.escalations e
        JOIN server.workspaces w ON e.workspace_id = w.workspace_id
        WHERE e.id = $1 AND e.project_id = $2 AND w.deleted_at IS NULL
          AND ($3::uuid IS NULL OR e.workspace_id = $3::uuid)
        "#,
    )
    .bind(escalation_id)
    .bind(project_id)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RespondedEscalation {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub status: String,
    pub response: String,
    pub response_note: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Record a response. `None` when the escalation does not exist in the
/// project or its workspace is gone.
pub async fn respond_escalation(
    pool: &PgPool,
    project_id: Uuid,
    escalation_id: Uuid,
    response: &str,
    note: Option<&str>,
) -> DbResult<Option<RespondedEscalation>> {
    let row = sqlx::query_as(
        r#"
        UPDATE server.escalations AS e
        SET status = 'responded',
            response = $1,
            response_note = $2,
            responded_at = NOW()
        FROM server.workspaces AS w
        WHERE e.id = $3
          AND e.workspace_id = w.workspace_id
          AND e.project_id = $4
          AND w.deleted_at IS NULL
        RETURNING e.id, e.workspace_id, e.status, e.response, e.response_note, e.responded_at
        "#,
    )
    .bind(response)
    .bind(note)
    .bind(escalation_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Move overdue pending escalations to `expired`. Expiry is lazy: callers
/// that present escalation state sweep first, so no background job is
/// needed. Returns the number of rows expired.
pub async fn expire_overdue(pool: &PgPool, project_id: Uuid) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE server.escalations
        SET status = 'expired'
        WHERE project_id = $1 AND status = 'pending'
          AND expires_at IS NOT NULL AND expires_at < NOW()
        "#,
    )
    .bind(project_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Pending escalations in the project (the status aggregator reports this).
pub async fn count_pending(pool: &PgPool, project_id: Uuid) -> DbResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM server.escalations WHERE status = 'pending' AND project_id = $1",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await
    .map_err(crate::DbError::from)?;
    Ok(count)
}
