//! Test doubles shared by unit tests

use std::sync::Mutex;

use async_trait::async_trait;

use crate::presence::{PresenceEvent, PresenceEventKind};
use crate::pubsub::PubSub;

/// Records every published event, optionally failing or stalling
#[derive(Default)]
pub(crate) struct RecordingPubSub {
    pub events: Mutex<Vec<(String, PresenceEvent)>>,
    pub fail: bool,
    pub stall: bool,
}

impl RecordingPubSub {
    pub fn events(&self) -> Vec<(String, PresenceEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds_for(&self, stream: &str, id: &str) -> Vec<PresenceEventKind> {
        self.events()
            .into_iter()
            .filter(|(s, e)| s == stream && e.id == id)
            .map(|(_, e)| e.kind)
            .collect()
    }
}

#[async_trait]
impl PubSub for RecordingPubSub {
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.fail {
            anyhow::bail!("transport unavailable");
        }
        let event: PresenceEvent = serde_json::from_slice(payload)?;
        self.events
            .lock()
            .unwrap()
            .push((stream.to_string(), event));
        Ok(())
    }
}
