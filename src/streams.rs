//! Stream resolution
//!
//! Maps a subscription identifier to the stream whose presence it tracks.
//! Accepted forms:
//!
//! - a plain stream name: `chat:42`
//! - an AnyCable public stream: `{"channel":"$pubsub","stream_name":"chat:42"}`
//!
//! Signed streams are verified upstream and arrive here already resolved.

use serde::Deserialize;

/// Channel identifier for public streams
pub const PUBSUB_CHANNEL: &str = "$pubsub";

/// $pubsub channel subscribe request
#[derive(Debug, Deserialize)]
struct PubSubRequest {
    channel: String,
    #[serde(default)]
    stream_name: Option<String>,
}

/// Resolve a subscription identifier to a stream name
pub fn resolve(identifier: &str) -> Result<String, StreamError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(StreamError::MissingStream);
    }

    if !trimmed.starts_with('{') {
        return Ok(trimmed.to_string());
    }

    let request: PubSubRequest = serde_json::from_str(trimmed)?;
    if request.channel != PUBSUB_CHANNEL {
        return Err(StreamError::UnknownChannel(request.channel));
    }

    match request.stream_name {
        Some(stream) if !stream.is_empty() => Ok(stream),
        _ => Err(StreamError::MissingStream),
    }
}

/// Errors during stream resolution
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("missing stream name")]
    MissingStream,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
