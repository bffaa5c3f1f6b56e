//! Wire-format invariants for the event stream: flat JSON with a dotted
//! `type` tag, categories derived from the prefix, and channel naming that
//! keeps every event on its own workspace's channel.

use bh_events::event::category_of_json;
use bh_events::{channel_name, Event, EventKind};

fn sample_events() -> Vec<Event> {
    vec![
        Event::now(
            "ws-1",
            EventKind::BeadStatusChanged {
                project_id: String::new(),
                bead_id: "bd-1".into(),
                repo: "github.com/acme/widgets".into(),
                old_status: "open".into(),
                new_status: "closed".into(),
                title: Some("title".into()),
                alias: "alice".into(),
            },
        ),
        Event::now(
            "ws-2",
            EventKind::MessageDelivered {
                message_id: "m-1".into(),
                from_workspace: "ws-9".into(),
                from_alias: "bob".into(),
                to_alias: "carol".into(),
                subject: "hi".into(),
                priority: "normal".into(),
            },
        ),
        Event::now(
            "ws-3",
            EventKind::EscalationCreated {
                escalation_id: "e-1".into(),
                alias: "dave".into(),
                subject: "stuck".into(),
            },
        ),
        Event::now(
            "ws-4",
            EventKind::ReservationRenewed {
                paths: vec!["src/lib.rs".into()],
                alias: "eve".into(),
                ttl_seconds: 300,
            },
        ),
        Event::now(
            "ws-5",
            EventKind::ChatMessage {
                session_id: "s-1".into(),
                message_id: "m-2".into(),
                from_alias: "frank".into(),
                to_aliases: vec!["grace".into()],
                preview: "hello".into(),
            },
        ),
    ]
}

#[test]
fn every_event_round_trips_and_keeps_its_type_tag() {
    for event in sample_events() {
        let json = event.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], event.event_type(), "payload: {json}");
        assert_eq!(value["workspace_id"], event.workspace_id.as_str());

        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }
}

#[test]
fn category_is_the_dotted_prefix() {
    let expectations = [
        ("bead.status_changed", "bead"),
        ("message.delivered", "message"),
        ("escalation.created", "escalation"),
        ("reservation.renewed", "reservation"),
        ("chat.message_sent", "chat"),
    ];
    for (event, (event_type, category)) in sample_events().iter().zip(expectations) {
        assert_eq!(event.event_type(), event_type);
        assert_eq!(event.category(), category);
    }
}

#[test]
fn category_filter_reads_raw_payloads() {
    for event in sample_events() {
        assert_eq!(
            category_of_json(&event.to_json()).as_deref(),
            Some(event.category())
        );
    }
}

#[test]
fn channel_is_scoped_to_the_workspace() {
    for event in sample_events() {
        let channel = channel_name(&event.workspace_id);
        assert_eq!(channel, format!("events:{}", event.workspace_id));
    }
}

#[test]
fn claim_events_tolerate_missing_titles() {
    let event = Event::now(
        "ws-7",
        EventKind::BeadUnclaimed {
            bead_id: "bd-7".into(),
            alias: "alice".into(),
            title: None,
        },
    );
    let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
    assert!(value["title"].is_null());
    assert_eq!(value["type"], "bead.unclaimed");
}
