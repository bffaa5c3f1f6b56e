//! Real-time event fan-out over Redis pub/sub.
//!
//! Every workspace has one channel (`events:<workspace_id>`). Publishers fire
//! and forget; delivery is best-effort, at-most-once, with no replay. The
//! [`stream`] module turns a pub/sub subscription across many channels into a
//! Server-Sent-Events byte stream with keepalives and reconnection.

pub mod event;
pub mod stream;

pub use event::{Event, EventKind};
pub use stream::{stream_events_multi, StreamOptions};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Redis pub/sub channel for a workspace.
pub fn channel_name(workspace_id: &str) -> String {
    format!("events:{workspace_id}")
}

/// Publish an event to its workspace channel. Returns the subscriber count,
/// which is informational only: zero subscribers is not an error.
pub async fn publish_event(
    conn: &mut ConnectionManager,
    event: &Event,
) -> redis::RedisResult<i64> {
    let channel = channel_name(&event.workspace_id);
    let payload = event.to_json();
    let count: i64 = conn.publish(&channel, payload).await?;
    debug!(event_type = event.event_type(), channel = %channel, subscribers = count, "published event");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming() {
        assert_eq!(channel_name("abc"), "events:abc");
    }
}
