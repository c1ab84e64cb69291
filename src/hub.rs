//! Connection Hub
//!
//! In-process broadcast transport: fans presence events out to every
//! connection subscribed to a stream. Uses tokio::sync::broadcast for O(1)
//! fan-out, with one forwarding task per (connection, stream).

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::actioncable::{self, ServerMessage};
use crate::pubsub::PubSub;

/// Broadcast channel capacity per stream
const STREAM_CAPACITY: usize = 256;

/// Hub manages stream subscriptions of all connections
#[derive(Default)]
pub struct Hub {
    /// Stream broadcast senders: stream_name -> broadcast::Sender
    streams: DashMap<String, broadcast::Sender<Vec<u8>>>,

    /// Subscription tasks: conn_id -> (stream -> AbortHandle)
    subscriptions: DashMap<u64, HashMap<String, AbortHandle>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a stream; payloads are forwarded to `outgoing`
    pub fn subscribe(&self, conn_id: u64, stream: &str, outgoing: mpsc::Sender<Vec<u8>>) {
        if let Some(subs) = self.subscriptions.get(&conn_id)
            && subs.contains_key(stream)
        {
            debug!(conn_id, stream, "already subscribed to stream");
            return;
        }

        // Get or create broadcast sender for this stream
        let mut rx = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
            .subscribe();

        let stream_name = stream.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if outgoing.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn_id, stream = %stream_name, lagged = n, "receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        });

        self.subscriptions
            .entry(conn_id)
            .or_default()
            .insert(stream.to_string(), handle.abort_handle());

        debug!(conn_id, stream, "subscribed to stream");
    }

    /// Unsubscribe a connection from a stream
    pub fn unsubscribe(&self, conn_id: u64, stream: &str) {
        if let Some(mut subs) = self.subscriptions.get_mut(&conn_id)
            && let Some(handle) = subs.remove(stream)
        {
            handle.abort();
        }

        self.cleanup_stream(stream);
        debug!(conn_id, stream, "unsubscribed from stream");
    }

    /// Drop every subscription of a connection
    pub fn remove_connection(&self, conn_id: u64) {
        if let Some((_, subs)) = self.subscriptions.remove(&conn_id) {
            for (stream, handle) in subs {
                handle.abort();
                self.cleanup_stream(&stream);
            }
        }
        debug!(conn_id, "connection removed from hub");
    }

    /// Broadcast payload to all subscribers of a stream, returning the receiver count
    pub fn broadcast(&self, stream: &str, payload: &[u8]) -> usize {
        let Some(sender) = self.streams.get(stream) else {
            debug!(stream, "no subscribers for broadcast");
            return 0;
        };

        let result = sender.send(payload.to_vec());
        drop(sender);

        match result {
            Ok(n) => {
                debug!(stream, receivers = n, "broadcast sent");
                n
            }
            Err(_) => {
                debug!(stream, "no receivers for broadcast");
                self.cleanup_stream(stream);
                0
            }
        }
    }

    /// Get subscriber count for a stream
    pub fn stream_subscriber_count(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Get stream count
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // Aborted forwarding tasks drop their receivers asynchronously, so a
    // stream may linger until the next cleanup or the next broadcast to it.
    fn cleanup_stream(&self, stream: &str) {
        let removed = self
            .streams
            .remove_if(stream, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            debug!(stream, "removed empty stream");
        }
    }
}

#[async_trait]
impl PubSub for Hub {
    /// Wrap a presence event as an ActionCable `presence` message and fan it out
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        let message: serde_json::Value = serde_json::from_slice(payload)?;
        let encoded = actioncable::encode(&ServerMessage::Presence {
            identifier: stream.to_string(),
            message,
        })?;
        self.broadcast(stream, &encoded);
        Ok(())
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("streams", &self.streams.len())
            .field("connections", &self.subscriptions.len())
            .finish()
    }
}
