//! Append-only audit log. Writes are best-effort at call sites: a failed
//! audit insert is logged and never fails the request that caused it.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbResult;

pub async fn record_audit(
    pool: &PgPool,
    project_id: Uuid,
    workspace_id: Option<Uuid>,
    event_type: &str,
    details: Value,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO server.audit_log (project_id, workspace_id, event_type, details)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(project_id)
    .bind(workspace_id)
    .bind(event_type)
    .bind(details)
    .execute(pool)
    .await?;
    Ok(())
}
