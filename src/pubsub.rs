//! Broadcast transport abstraction
//!
//! Presence events leave the engine through this trait. The transport owns
//! the wire format and the fan-out to stream subscribers; the in-process
//! implementation is [`Hub`](crate::hub::Hub).

use async_trait::async_trait;

/// Broadcast transport trait
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message to a stream
    ///
    /// All subscribers of this stream should receive the message. Returning
    /// an error only gets logged by the caller.
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()>;
}
