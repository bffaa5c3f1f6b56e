//! Multi-channel SSE streaming from Redis pub/sub.
//!
//! One long-lived HTTP response subscribes to many workspace channels. The
//! pump task owns the pub/sub connection and pushes ready-made SSE frames
//! (`data: <json>\n\n`, `: keepalive\n\n`) into a bounded channel; the HTTP
//! layer turns the receiver into the response body. Dropping the response
//! closes the channel, which the pump observes on its next iteration — that
//! is the client-disconnect signal.
//!
//! A dropped Redis connection does not end the stream: the pump keeps sending
//! keepalives and re-subscribes with exponential backoff (0.1 s doubling up
//! to 5 s, reset on success). Events published while disconnected are lost;
//! delivery is best-effort with no replay.

use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::channel_name;
use crate::event::category_of_json;

/// How long an empty-workspace stream keeps emitting keepalives before
/// closing itself. Guards against leaked connections when disconnect
/// detection fails.
const EMPTY_STREAM_MAX: Duration = Duration::from_secs(5 * 60);

const RECONNECT_DELAY_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for one SSE subscription.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Event categories to pass through (`bead`, `message`, …). `None`
    /// streams everything.
    pub categories: Option<HashSet<String>>,
    /// Seconds of silence before a keepalive comment is emitted.
    pub keepalive_seconds: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            categories: None,
            keepalive_seconds: 30,
        }
    }
}

/// Subscribe to the given workspaces' channels and return the SSE frame
/// stream. The pump task is detached; it exits when the receiver is dropped.
pub fn stream_events_multi(
    client: redis::Client,
    workspace_ids: Vec<String>,
    options: StreamOptions,
) -> ReceiverStream<Result<String, Infallible>> {
    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(64);
    tokio::spawn(pump(client, workspace_ids, options, tx));
    ReceiverStream::new(rx)
}

async fn pump(
    client: redis::Client,
    workspace_ids: Vec<String>,
    options: StreamOptions,
    tx: mpsc::Sender<Result<String, Infallible>>,
) {
    let keepalive = Duration::from_secs(options.keepalive_seconds.max(1));
    let channels: Vec<String> = workspace_ids.iter().map(|id| channel_name(id)).collect();

    // New projects have no workspaces yet: keep the connection warm with
    // keepalives for a bounded time, then close.
    if channels.is_empty() {
        let started = Instant::now();
        while started.elapsed() < EMPTY_STREAM_MAX {
            tokio::time::sleep(keepalive).await;
            if tx.send(Ok(": keepalive\n\n".to_string())).await.is_err() {
                debug!("client disconnected (empty workspace stream)");
                return;
            }
        }
        debug!("empty workspace stream reached max duration, closing");
        return;
    }

    let mut pubsub = connect(&client, &channels).await.ok();
    let mut reconnect_delay = RECONNECT_DELAY_INITIAL;
    let mut next_reconnect_at: Option<Instant> = None;
    let mut last_output = Instant::now();
    let mut last_ping = Instant::now();

    loop {
        if tx.is_closed() {
            debug!(channels = channels.len(), "client disconnected, ending stream");
            return;
        }

        let now = Instant::now();

        // Disconnected: keep keepalives flowing while we wait out the backoff.
        if pubsub.is_none() {
            if next_reconnect_at.map_or(true, |at| now >= at) {
                match connect(&client, &channels).await {
                    Ok(ps) => {
                        pubsub = Some(ps);
                        reconnect_delay = RECONNECT_DELAY_INITIAL;
                        next_reconnect_at = None;
                        last_output = now;
                        last_ping = now;
                    }
                    Err(err) => {
                        warn!(error = %err, "pub/sub reconnect failed; will retry");
                        next_reconnect_at = Some(now + reconnect_delay);
                        reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                    }
                }
            }

            if now.duration_since(last_output) >= keepalive {
                if tx.send(Ok(": keepalive\n\n".to_string())).await.is_err() {
                    return;
                }
                last_output = Instant::now();
            }
            tokio::time::sleep(READ_TIMEOUT.min(keepalive)).await;
            continue;
        }

        // Read one message with a short timeout so disconnects and keepalive
        // deadlines are observed promptly. `Ok(None)` means the message
        // stream ended: the connection dropped underneath us.
        let read = {
            let ps = pubsub.as_mut().expect("pubsub checked above");
            let mut messages = ps.on_message();
            tokio::time::timeout(READ_TIMEOUT, messages.next()).await
        };
        let message = match read {
            Ok(Some(msg)) => Some(msg),
            Ok(None) => {
                info!("pub/sub connection dropped; reconnecting");
                pubsub = None;
                next_reconnect_at = Some(Instant::now() + reconnect_delay);
                reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                continue;
            }
            Err(_) => None,
        };

        let now = Instant::now();

        if let Some(msg) = message {
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    let passes = match &options.categories {
                        None => true,
                        Some(filter) => category_of_json(&payload)
                            .map(|cat| filter.contains(&cat))
                            .unwrap_or(false),
                    };
                    if passes {
                        if tx.send(Ok(format!("data: {payload}\n\n"))).await.is_err() {
                            return;
                        }
                        last_output = now;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "undecodable pub/sub payload, skipping");
                }
            }
        }

        if now.duration_since(last_output) >= keepalive {
            // Silent connections can die without the read path noticing;
            // ping before relying on them further.
            if now.duration_since(last_ping) >= keepalive {
                let ps = pubsub.as_mut().expect("pubsub checked above");
                match ps.ping::<String>().await {
                    Ok(_) => last_ping = now,
                    Err(err) => {
                        info!(error = %err, "pub/sub ping failed; reconnecting");
                        pubsub = None;
                        next_reconnect_at = Some(now + reconnect_delay);
                        reconnect_delay = (reconnect_delay * 2).min(RECONNECT_DELAY_MAX);
                    }
                }
            }

            if tx.send(Ok(": keepalive\n\n".to_string())).await.is_err() {
                return;
            }
            last_output = Instant::now();
        }
    }
}

async fn connect(
    client: &redis::Client,
    channels: &[String],
) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    debug!(channels = channels.len(), "subscribed to event channels");
    Ok(pubsub)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = StreamOptions::default();
        assert_eq!(opts.keepalive_seconds, 30);
        assert!(opts.categories.is_none());
    }

    #[tokio::test]
    async fn empty_workspace_stream_ends_when_client_drops() {
        // An unreachable Redis is fine here: the empty-workspace path never
        // connects. Dropping the receiver must stop the pump at the next
        // keepalive tick.
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let stream = stream_events_multi(
            client,
            vec![],
            StreamOptions {
                categories: None,
                keepalive_seconds: 1,
            },
        );
        drop(stream);
        // Nothing to assert beyond "does not hang": give the pump a moment
        // to observe the closed channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn empty_workspace_stream_emits_keepalives() {
        use futures_util::StreamExt as _;
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let mut stream = stream_events_multi(
            client,
            vec![],
            StreamOptions {
                categories: None,
                keepalive_seconds: 1,
            },
        );
        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("keepalive within deadline")
            .expect("stream open")
            .expect("infallible");
        assert_eq!(frame, ": keepalive\n\n");
    }
}
