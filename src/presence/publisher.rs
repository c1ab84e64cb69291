//! Presence event publisher
//!
//! `notify` never blocks the caller: events go into a bounded queue and a
//! single dispatcher task hands them to the [`PubSub`] transport in FIFO
//! order. Since the registry enqueues while holding the stream lock, events
//! for one stream leave in the order their state transitions happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::PresenceEvent;
use crate::pubsub::PubSub;

/// A presence event addressed to a stream
#[derive(Debug, Clone)]
pub struct Notification {
    pub stream: String,
    pub event: PresenceEvent,
}

enum Dispatch {
    Event(Notification),
    Flush(oneshot::Sender<()>),
}

/// Hands presence events to the broadcast transport
pub struct EventPublisher {
    tx: mpsc::Sender<Dispatch>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Create a publisher and spawn its dispatcher on the current runtime.
    ///
    /// The dispatcher stops once the publisher is dropped and the queue is drained.
    pub fn new(pubsub: Arc<dyn PubSub>, capacity: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(dispatch(pubsub, rx, timeout));

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event for the stream's subscribers
    pub fn notify(&self, stream: &str, event: PresenceEvent) {
        let notification = Notification {
            stream: stream.to_string(),
            event,
        };

        match self.tx.try_send(Dispatch::Event(notification)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Dispatch::Event(n))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream = %n.stream,
                    presence_id = %n.event.id,
                    kind = n.event.kind.as_str(),
                    "presence queue full, dropping event"
                );
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stream, "presence dispatcher stopped, dropping event");
            }
        }
    }

    /// Wait until every event queued before this call has been dispatched.
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let flushed = async {
            self.tx.send(Dispatch::Flush(ack_tx)).await.ok()?;
            ack_rx.await.ok()
        };

        matches!(tokio::time::timeout(timeout, flushed).await, Ok(Some(())))
    }

    /// Number of events dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn dispatch(pubsub: Arc<dyn PubSub>, mut rx: mpsc::Receiver<Dispatch>, timeout: Duration) {
    while let Some(item) = rx.recv().await {
        let notification = match item {
            Dispatch::Event(n) => n,
            Dispatch::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        let payload = match serde_json::to_vec(&notification.event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    stream = %notification.stream,
                    error = %e,
                    "failed to serialize presence event"
                );
                continue;
            }
        };

        match tokio::time::timeout(timeout, pubsub.publish(&notification.stream, &payload)).await {
            Ok(Ok(())) => {
                debug!(
                    stream = %notification.stream,
                    presence_id = %notification.event.id,
                    kind = notification.event.kind.as_str(),
                    "presence event published"
                );
            }
            Ok(Err(e)) => {
                warn!(stream = %notification.stream, error = %e, "presence broadcast failed");
            }
            Err(_) => {
                warn!(
                    stream = %notification.stream,
                    timeout_ms = timeout.as_millis() as u64,
                    "presence broadcast timed out"
                );
            }
        }
    }

    debug!("presence dispatcher stopped");
}
