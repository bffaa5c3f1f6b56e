//! Transactional notification outbox.
//!
//! Status changes become one intent row per (subscriber × change), written in
//! the same transaction as the issue mutations. A processor later claims
//! pending intents with `FOR UPDATE SKIP LOCKED` — several processors can
//! share the load without double-delivering a row — and sends each as a mail
//! message. Failures increment `attempts` and record `last_error`; rows are
//! abandoned after [`MAX_ATTEMPTS`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::sync::StatusChange;
use crate::{DbError, DbResult};

/// Intents are skipped once they have failed this many times.
pub const MAX_ATTEMPTS: i32 = 5;

// ---------------------------------------------------------------------------
// Mail seam
// ---------------------------------------------------------------------------

/// A notification ready for delivery.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub project_id: Uuid,
    pub from_agent_id: Option<Uuid>,
    pub from_alias: String,
    pub to_agent_id: Uuid,
    pub to_alias: String,
    pub subject: String,
    pub body: String,
}

/// Delivery backend. The production implementation writes into the embedded
/// mail store; tests capture sends in memory.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), String>;
}

/// Delivers into `aweb.messages`, the inbox agents poll.
pub struct SqlMailStore {
    pool: PgPool,
}

impl SqlMailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailSender for SqlMailStore {
    async fn send(&self, message: &OutboundMessage) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT INTO aweb.messages
                (project_id, from_agent_id, to_agent_id, from_alias, to_alias, subject, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.project_id)
        .bind(message.from_agent_id)
        .bind(message.to_agent_id)
        .bind(&message.from_alias)
        .bind(&message.to_alias)
        .bind(&message.subject)
        .bind(&message.body)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct Subscriber {
    workspace_id: Uuid,
    alias: String,
}

/// Insert one intent per (subscriber × status change) inside the caller's
/// transaction. Duplicate (recipient, bead, transition) pairs within the
/// batch collapse to one intent.
pub async fn record_intents_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    status_changes: &[StatusChange],
    synced_at: DateTime<Utc>,
) -> DbResult<usize> {
    let mut seen: HashSet<(Uuid, String, Option<String>, String)> = HashSet::new();
    let mut recorded = 0usize;

    for change in status_changes {
        let subscribers: Vec<Subscriber> = sqlx::query_as(
            r#"
            SELECT workspace_id, alias
            FROM server.subscriptions
            WHERE project_id = $1
              AND bead_id = $2
              AND (repo IS NULL OR repo = $3)
              AND ('status_change' = ANY(event_types) OR 'all' = ANY(event_types))
            "#,
        )
        .bind(project_id)
        .bind(&change.bead_id)
        .bind(&change.repo)
        .fetch_all(&mut **tx)
        .await?;

        for subscriber in subscribers {
            let key = (
                subscriber.workspace_id,
                change.bead_id.clone(),
                change.old_status.clone(),
                change.new_status.clone(),
            );
            if !seen.insert(key) {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO server.notification_intents (
                    id, project_id, recipient_workspace_id, recipient_alias,
                    bead_id, old_status, new_status, title, synced_at
                )
                VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(project_id)
            .bind(subscriber.workspace_id)
            .bind(&subscriber.alias)
            .bind(&change.bead_id)
            .bind(&change.old_status)
            .bind(&change.new_status)
            .bind(&change.title)
            .bind(synced_at)
            .execute(&mut **tx)
            .await?;
            recorded += 1;
        }
    }

    Ok(recorded)
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct PendingIntent {
    id: Uuid,
    recipient_workspace_id: Uuid,
    recipient_alias: String,
    bead_id: String,
    old_status: Option<String>,
    new_status: String,
    title: Option<String>,
    synced_at: DateTime<Utc>,
}

/// Render the mail for one intent. Subject and body carry the transition and
/// sync timestamp so duplicate deliveries are recognizable by the recipient.
fn render_message(
    intent: &PendingIntent,
    project_id: Uuid,
    sender_agent_id: Uuid,
    sender_alias: &str,
) -> OutboundMessage {
    let title = intent.title.as_deref().unwrap_or("(no title)");
    let old = intent.old_status.as_deref().unwrap_or("(new)");
    OutboundMessage {
        project_id,
        from_agent_id: Some(sender_agent_id),
        from_alias: sender_alias.to_string(),
        to_agent_id: intent.recipient_workspace_id,
        to_alias: intent.recipient_alias.clone(),
        subject: format!("Bead status changed: {}", intent.bead_id),
        body: format!(
            "{title}\n\n{bead}: {old} -> {new}\nsynced_at: {synced}",
            bead = intent.bead_id,
            new = intent.new_status,
            synced = intent.synced_at.to_rfc3339(),
        ),
    }
}

/// Claim and deliver pending intents for a project. Returns
/// `(sent, failed)`.
pub async fn process_outbox(
    pool: &PgPool,
    mail: &dyn MailSender,
    project_id: Uuid,
    sender_agent_id: Uuid,
    sender_alias: &str,
) -> DbResult<(usize, usize)> {
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let pending: Vec<PendingIntent> = sqlx::query_as(
        r#"
        SELECT id, recipient_workspace_id, recipient_alias, bead_id,
               old_status, new_status, title, synced_at
        FROM server.notification_intents
        WHERE project_id = $1 AND processed_at IS NULL AND attempts < $2
        ORDER BY created_at
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(project_id)
    .bind(MAX_ATTEMPTS)
    .fetch_all(&mut *tx)
    .await?;

    let mut sent = 0usize;
    let mut failed = 0usize;

    for intent in &pending {
        let message = render_message(intent, project_id, sender_agent_id, sender_alias);
        match mail.send(&message).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE server.notification_intents SET processed_at = NOW() WHERE id = $1",
                )
                .bind(intent.id)
                .execute(&mut *tx)
                .await?;
                sent += 1;
            }
            Err(err) => {
                warn!(intent = %intent.id, error = %err, "notification delivery failed");
                sqlx::query(
                    r#"
                    UPDATE server.notification_intents
                    SET attempts = attempts + 1, last_error = $2
                    WHERE id = $1
                    "#,
                )
                .bind(intent.id)
                .bind(&err)
                .execute(&mut *tx)
                .await?;
                failed += 1;
            }
        }
    }

    tx.commit().await.map_err(DbError::from)?;
    Ok((sent, failed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_subject_names_the_bead() {
        let intent = PendingIntent {
            id: Uuid::new_v4(),
            recipient_workspace_id: Uuid::new_v4(),
            recipient_alias: "alice".into(),
            bead_id: "bd-7".into(),
            old_status: Some("open".into()),
            new_status: "closed".into(),
            title: Some("Fix the thing".into()),
            synced_at: Utc::now(),
        };
        let msg = render_message(&intent, Uuid::new_v4(), Uuid::new_v4(), "bob");
        assert_eq!(msg.subject, "Bead status changed: bd-7");
        assert!(msg.body.contains("open -> closed"));
        assert!(msg.body.contains("Fix the thing"));
        assert!(msg.body.contains("synced_at:"));
    }

    #[test]
    fn rendered_body_marks_first_sight() {
        let intent = PendingIntent {
            id: Uuid::new_v4(),
            recipient_workspace_id: Uuid::new_v4(),
            recipient_alias: "alice".into(),
            bead_id: "bd-8".into(),
            old_status: None,
            new_status: "in_progress".into(),
            title: None,
            synced_at: Utc::now(),
        };
        let msg = render_message(&intent, Uuid::new_v4(), Uuid::new_v4(), "bob");
        assert!(msg.body.contains("(new) -> in_progress"));
        assert!(msg.body.contains("(no title)"));
    }
}
