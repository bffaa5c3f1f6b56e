//! Per-workspace bead subscriptions.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;

pub const VALID_EVENT_TYPES: &[&str] =
    &["status_change", "priority_change", "assignee_change", "all"];

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub alias: String,
    pub bead_id: String,
    pub repo: Option<String>,
    pub event_types: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Idempotent subscribe: a second call with the same
/// `(workspace, bead, repo)` updates the event types instead of duplicating.
pub async fn upsert_subscription(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    alias: &str,
    bead_id: &str,
    repo: Option<&str>,
    event_types: &[String],
) -> DbResult<SubscriptionRow> {
    let row = sqlx::query_as(
        r#"
        INSERT INTO server.subscriptions
            (id, project_id, workspace_id, alias, bead_id, repo, event_types)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (project_id, workspace_id, bead_id, COALESCE(repo, ''))
        DO UPDATE SET event_types = EXCLUDED.event_types
        RETURNING id, workspace_id, alias, bead_id, repo, event_types, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(workspace_id)
    .bind(alias)
    .bind(bead_id)
    .bind(repo)
    .bind(event_types)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn list_subscriptions(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
) -> DbResult<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as(
        r#"
        SELECT id, workspace_id, alias, bead_id, repo, event_types, created_at
        FROM server.subscriptions
        WHERE project_id = $1 AND workspace_id = $2
        ORDER BY created_at DESC
        "#,
    )
    .bind(project_id)
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Delete a subscription owned by the given workspace. Returns false when no
/// matching row exists (wrong id, wrong owner, or wrong project).
pub async fn delete_subscription(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Uuid,
    alias: &str,
    subscription_id: Uuid,
) -> DbResult<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        DELETE FROM server.subscriptions
        WHERE id = $1 AND project_id = $2 AND workspace_id = $3 AND alias = $4
        RETURNING id
        "#,
    )
    .bind(subscription_id)
    .bind(project_id)
    .bind(workspace_id)
    .bind(alias)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}
