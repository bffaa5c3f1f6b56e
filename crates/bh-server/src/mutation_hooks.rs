//! Mutation-hook event translator.
//!
//! Collaborating subsystems (mail, chat, reservations, agent lifecycle) call
//! [`MutationHook::on_mutation`] after their own transactions commit. The
//! hook translates the raw event into a typed record, enriches it from
//! presence and the database, and publishes it to the recipient workspace's
//! channel.
//!
//! The hook must never raise. Business correctness lives in the SQL
//! transaction that already committed; everything here is best-effort and
//! every failure is logged and swallowed.

use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use bh_db::DatabaseInfra;
use bh_events::{publish_event, Event, EventKind};
use bh_presence::{clear_workspace_presence, get_agent_presence, get_workspace_project_slug};

pub struct MutationHook {
    db: DatabaseInfra,
    redis: ConnectionManager,
}

fn ctx_str(ctx: &Value, key: &str) -> String {
    ctx.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn ctx_u64(ctx: &Value, key: &str) -> u64 {
    ctx.get(key).and_then(Value::as_u64).unwrap_or(0)
}

impl MutationHook {
    pub fn new(db: DatabaseInfra, redis: ConnectionManager) -> Self {
        Self { db, redis }
    }

    /// Entry point registered with the collaborating subsystems.
    pub async fn on_mutation(&self, event_type: &str, ctx: &Value) {
        // Side effects come first so cascades run even when no event is
        // published for the mutation.
        if event_type == "agent.deregistered" {
            self.cascade_agent_deregistered(ctx).await;
            return;
        }

        let Some(mut event) = translate(event_type, ctx) else {
            return;
        };
        if event.workspace_id.is_empty() {
            warn!(event_type, "skipping event: no workspace_id in context");
            return;
        }

        if let Err(err) = self.enrich(&mut event).await {
            warn!(event_type, error = %err, "enrichment failed, publishing with defaults");
        }

        let mut conn = self.redis.clone();
        if let Err(err) = publish_event(&mut conn, &event).await {
            warn!(event_type, error = %err, "failed to publish event");
        }
    }

    /// Agent deregistration cascades into the coordination schema: the
    /// matching workspace (same id) is soft-deleted, its claims dropped, and
    /// its presence cleared. Each step is independently best-effort.
    async fn cascade_agent_deregistered(&self, ctx: &Value) {
        let agent_id = ctx_str(ctx, "agent_id");
        let project_id = ctx_str(ctx, "project_id");
        let (Ok(agent_uuid), Ok(project_uuid)) =
            (Uuid::parse_str(&agent_id), Uuid::parse_str(&project_id))
        else {
            warn!("agent.deregistered without usable agent_id/project_id");
            return;
        };

        match bh_db::registry::soft_delete_workspace(self.db.pool(), project_uuid, agent_uuid)
            .await
        {
            Ok(outcome) => {
                tracing::debug!(agent_id = %agent_uuid, ?outcome, "deregister cascade: workspace");
            }
            Err(err) => {
                warn!(agent_id = %agent_uuid, error = %err, "deregister cascade: workspace soft-delete failed");
            }
        }

        let mut conn = self.redis.clone();
        if let Err(err) = clear_workspace_presence(&mut conn, &[agent_id]).await {
            warn!(agent_id = %agent_uuid, error = %err, "deregister cascade: presence clear failed");
        }
    }

    async fn alias_for(&self, workspace_id: &str) -> String {
        let mut conn = self.redis.clone();
        match get_agent_presence(&mut conn, workspace_id).await {
            Ok(Some(presence)) => presence.get("alias").cloned().unwrap_or_default(),
            _ => String::new(),
        }
    }

    async fn slug_for(&self, workspace_id: &str) -> Option<String> {
        let mut conn = self.redis.clone();
        get_workspace_project_slug(&mut conn, workspace_id)
            .await
            .ok()
            .flatten()
    }

    async fn enrich(&self, event: &mut Event) -> Result<(), String> {
        let workspace_id = event.workspace_id.clone();
        event.project_slug = self.slug_for(&workspace_id).await;

        match &mut event.kind {
            EventKind::MessageDelivered {
                from_workspace,
                from_alias,
                to_alias,
                ..
            } => {
                *from_alias = self.alias_for(&from_workspace.clone()).await;
                *to_alias = self.alias_for(&workspace_id).await;
            }
            EventKind::MessageAcknowledged {
                message_id,
                from_alias,
                subject,
            } => {
                if let Ok(message_uuid) = Uuid::parse_str(message_id) {
                    let row: Option<(String, String)> = sqlx::query_as(
                        "SELECT from_alias, subject FROM aweb.messages WHERE message_id = $1",
                    )
                    .bind(message_uuid)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(|e| e.to_string())?;
                    if let Some((sender, subj)) = row {
                        *from_alias = sender;
                        *subject = subj;
                    }
                }
            }
            EventKind::ChatMessage { from_alias, .. } => {
                *from_alias = self.alias_for(&workspace_id).await;
            }
            EventKind::ReservationAcquired { alias, .. }
            | EventKind::ReservationReleased { alias, .. } => {
                *alias = self.alias_for(&workspace_id).await;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Map a raw mutation event to a typed record. Unknown types are ignored.
fn translate(event_type: &str, ctx: &Value) -> Option<Event> {
    match event_type {
        "message.sent" => Some(Event::now(
            ctx_str(ctx, "to_agent_id"),
            EventKind::MessageDelivered {
                message_id: ctx_str(ctx, "message_id"),
                from_workspace: ctx_str(ctx, "from_agent_id"),
                from_alias: String::new(),
                to_alias: String::new(),
                subject: ctx_str(ctx, "subject"),
                priority: {
                    let p = ctx_str(ctx, "priority");
                    if p.is_empty() {
                        "normal".into()
                    } else {
                        p
                    }
                },
            },
        )),
        "message.acknowledged" => Some(Event::now(
            ctx_str(ctx, "agent_id"),
            EventKind::MessageAcknowledged {
                message_id: ctx_str(ctx, "message_id"),
                from_alias: String::new(),
                subject: String::new(),
            },
        )),
        "chat.message_sent" => Some(Event::now(
            ctx_str(ctx, "from_agent_id"),
            EventKind::ChatMessage {
                session_id: ctx_str(ctx, "session_id"),
                message_id: ctx_str(ctx, "message_id"),
                from_alias: String::new(),
                to_aliases: Vec::new(),
                preview: ctx_str(ctx, "preview"),
            },
        )),
        "reservation.acquired" => Some(Event::now(
            ctx_str(ctx, "holder_agent_id"),
            EventKind::ReservationAcquired {
                paths: {
                    let key = ctx_str(ctx, "resource_key");
                    if key.is_empty() {
                        Vec::new()
                    } else {
                        vec![key]
                    }
                },
                alias: String::new(),
                ttl_seconds: ctx_u64(ctx, "ttl_seconds"),
                bead_id: None,
                reason: None,
                exclusive: true,
            },
        )),
        "reservation.released" => Some(Event::now(
            ctx_str(ctx, "holder_agent_id"),
            EventKind::ReservationReleased {
                paths: {
                    let key = ctx_str(ctx, "resource_key");
                    if key.is_empty() {
                        Vec::new()
                    } else {
                        vec![key]
                    }
                },
                alias: String::new(),
            },
        )),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translates_message_sent() {
        let ctx = json!({
            "to_agent_id": "ws-to",
            "from_agent_id": "ws-from",
            "message_id": "m-1",
            "subject": "ping",
        });
        let event = translate("message.sent", &ctx).unwrap();
        assert_eq!(event.workspace_id, "ws-to");
        assert_eq!(event.event_type(), "message.delivered");
        match event.kind {
            EventKind::MessageDelivered {
                from_workspace,
                subject,
                priority,
                ..
            } => {
                assert_eq!(from_workspace, "ws-from");
                assert_eq!(subject, "ping");
                assert_eq!(priority, "normal");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn translates_reservation_acquired() {
        let ctx = json!({
            "holder_agent_id": "ws-1",
            "resource_key": "src/main.rs",
            "ttl_seconds": 600,
        });
        let event = translate("reservation.acquired", &ctx).unwrap();
        match event.kind {
            EventKind::ReservationAcquired {
                paths,
                ttl_seconds,
                exclusive,
                ..
            } => {
                assert_eq!(paths, vec!["src/main.rs"]);
                assert_eq!(ttl_seconds, 600);
                assert!(exclusive);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_ignored() {
        assert!(translate("policy.changed", &json!({})).is_none());
    }

    #[test]
    fn missing_workspace_yields_empty_target() {
        let event = translate("message.sent", &json!({"message_id": "m"})).unwrap();
        assert!(event.workspace_id.is_empty());
    }
}
