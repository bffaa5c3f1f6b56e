//! Typed event records.
//!
//! The wire format is flat JSON with a dotted `type` tag, e.g.
//!
//! ```json
//! {"type": "bead.claimed", "workspace_id": "…", "timestamp": "…",
//!  "project_slug": "acme", "bead_id": "bd-7", "alias": "alice", "title": null}
//! ```
//!
//! The base fields (`workspace_id`, `timestamp`, `project_slug`) live on
//! [`Event`]; each variant of [`EventKind`] carries its own payload and is
//! flattened alongside them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An event addressed to one workspace's channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub workspace_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, tagged by their dotted type name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "reservation.acquired")]
    ReservationAcquired {
        paths: Vec<String>,
        alias: String,
        ttl_seconds: u64,
        bead_id: Option<String>,
        reason: Option<String>,
        exclusive: bool,
    },
    #[serde(rename = "reservation.released")]
    ReservationReleased { paths: Vec<String>, alias: String },
    #[serde(rename = "reservation.renewed")]
    ReservationRenewed {
        paths: Vec<String>,
        alias: String,
        ttl_seconds: u64,
    },
    #[serde(rename = "message.delivered")]
    MessageDelivered {
        message_id: String,
        from_workspace: String,
        from_alias: String,
        to_alias: String,
        subject: String,
        priority: String,
    },
    #[serde(rename = "message.acknowledged")]
    MessageAcknowledged {
        message_id: String,
        from_alias: String,
        subject: String,
    },
    #[serde(rename = "escalation.created")]
    EscalationCreated {
        escalation_id: String,
        alias: String,
        subject: String,
    },
    #[serde(rename = "escalation.responded")]
    EscalationResponded {
        escalation_id: String,
        response: String,
    },
    #[serde(rename = "chat.message_sent")]
    ChatMessage {
        session_id: String,
        message_id: String,
        from_alias: String,
        to_aliases: Vec<String>,
        preview: String,
    },
    #[serde(rename = "bead.status_changed")]
    BeadStatusChanged {
        project_id: String,
        bead_id: String,
        repo: String,
        old_status: String,
        new_status: String,
        title: Option<String>,
        alias: String,
    },
    #[serde(rename = "bead.claimed")]
    BeadClaimed {
        bead_id: String,
        alias: String,
        title: Option<String>,
    },
    #[serde(rename = "bead.unclaimed")]
    BeadUnclaimed {
        bead_id: String,
        alias: String,
        title: Option<String>,
    },
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn now(workspace_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            project_slug: None,
            kind,
        }
    }

    /// Attach the project slug used by dashboard-side routing.
    pub fn with_project_slug(mut self, slug: Option<String>) -> Self {
        self.project_slug = slug;
        self
    }

    /// The dotted type tag, e.g. `bead.claimed`.
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::ReservationAcquired { .. } => "reservation.acquired",
            EventKind::ReservationReleased { .. } => "reservation.released",
            EventKind::ReservationRenewed { .. } => "reservation.renewed",
            EventKind::MessageDelivered { .. } => "message.delivered",
            EventKind::MessageAcknowledged { .. } => "message.acknowledged",
            EventKind::EscalationCreated { .. } => "escalation.created",
            EventKind::EscalationResponded { .. } => "escalation.responded",
            EventKind::ChatMessage { .. } => "chat.message_sent",
            EventKind::BeadStatusChanged { .. } => "bead.status_changed",
            EventKind::BeadClaimed { .. } => "bead.claimed",
            EventKind::BeadUnclaimed { .. } => "bead.unclaimed",
        }
    }

    /// The category is the segment before the dot (`bead`, `message`, …).
    pub fn category(&self) -> &'static str {
        let t = self.event_type();
        t.split('.').next().unwrap_or(t)
    }

    /// JSON wire encoding.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Extract the category from a raw JSON event payload without binding it to a
/// known variant. Used by the SSE filter, which must pass through events it
/// does not model.
pub fn category_of_json(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let event_type = value.get("type")?.as_str()?;
    Some(event_type.split('.').next().unwrap_or(event_type).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_flat_and_tagged() {
        let event = Event::now(
            "ws-1",
            EventKind::BeadClaimed {
                bead_id: "bd-7".into(),
                alias: "alice".into(),
                title: Some("Fix flaky test".into()),
            },
        )
        .with_project_slug(Some("acme".into()));

        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "bead.claimed");
        assert_eq!(value["workspace_id"], "ws-1");
        assert_eq!(value["project_slug"], "acme");
        assert_eq!(value["bead_id"], "bd-7");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn round_trips_through_json() {
        let event = Event::now(
            "ws-2",
            EventKind::MessageDelivered {
                message_id: "m-1".into(),
                from_workspace: "ws-9".into(),
                from_alias: "bob".into(),
                to_alias: "alice".into(),
                subject: "hello".into(),
                priority: "normal".into(),
            },
        );
        let decoded: Event = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn categories() {
        let event = Event::now(
            "w",
            EventKind::ReservationReleased {
                paths: vec![],
                alias: String::new(),
            },
        );
        assert_eq!(event.category(), "reservation");
        assert_eq!(event.event_type(), "reservation.released");
    }

    #[test]
    fn category_of_raw_json() {
        assert_eq!(
            category_of_json(r#"{"type":"bead.status_changed"}"#).as_deref(),
            Some("bead")
        );
        assert_eq!(category_of_json("not json"), None);
        assert_eq!(category_of_json(r#"{"no_type":1}"#), None);
    }
}
