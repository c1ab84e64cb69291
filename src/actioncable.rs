//! ActionCable Protocol Implementation
//!
//! The presence subset of the ActionCable/AnyCable protocol, one JSON object
//! per line.
//!
//! ## Client Commands
//! - `subscribe`: Start receiving a stream's presence events
//! - `unsubscribe`: Stop receiving; this connection's presence leaves after the grace period
//! - `join`: Declare presence in a stream
//! - `leave`: Remove presence from a stream immediately
//! - `presence`: Query current presence list
//!
//! ## Server Messages
//! - `welcome`: Connection established
//! - `confirm_subscription`: Stream subscribed
//! - `reject_subscription`: Subscription or presence command refused
//! - `presence`: Join/leave event or presence info
//! - `error`: Unparseable command

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence data for join command
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

/// Client-to-server commands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        identifier: String,
    },
    Unsubscribe {
        identifier: String,
    },
    Join {
        identifier: String,
        #[serde(default)]
        presence: Option<PresenceData>,
    },
    Leave {
        identifier: String,
    },
    Presence {
        identifier: String,
    },
}

impl ClientCommand {
    pub fn identifier(&self) -> &str {
        match self {
            ClientCommand::Subscribe { identifier }
            | ClientCommand::Unsubscribe { identifier }
            | ClientCommand::Join { identifier, .. }
            | ClientCommand::Leave { identifier }
            | ClientCommand::Presence { identifier } => identifier,
        }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Welcome { sid: String },
    ConfirmSubscription { identifier: String },
    RejectSubscription { identifier: String, reason: String },
    Presence { identifier: String, message: Value },
    Error { reason: String },
}

#[derive(Serialize)]
struct WelcomePayload<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    sid: &'a str,
}

#[derive(Serialize)]
struct SubscriptionPayload<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Serialize)]
struct PresencePayload<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    identifier: &'a str,
    message: &'a Value,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    reason: &'a str,
}

/// Parse a client command from raw bytes
pub fn parse_command(data: &[u8]) -> Result<ClientCommand, ActionCableError> {
    serde_json::from_slice(data).map_err(ActionCableError::Parse)
}

/// Encode a server message to bytes
pub fn encode(msg: &ServerMessage) -> Result<Vec<u8>, ActionCableError> {
    let encoded = match msg {
        ServerMessage::Welcome { sid } => serde_json::to_vec(&WelcomePayload {
            msg_type: "welcome",
            sid,
        }),
        ServerMessage::ConfirmSubscription { identifier } => {
            serde_json::to_vec(&SubscriptionPayload {
                msg_type: "confirm_subscription",
                identifier,
                reason: None,
            })
        }
        ServerMessage::RejectSubscription { identifier, reason } => {
            serde_json::to_vec(&SubscriptionPayload {
                msg_type: "reject_subscription",
                identifier,
                reason: Some(reason),
            })
        }
        ServerMessage::Presence {
            identifier,
            message,
        } => serde_json::to_vec(&PresencePayload {
            msg_type: "presence",
            identifier,
            message,
        }),
        ServerMessage::Error { reason } => serde_json::to_vec(&ErrorPayload {
            msg_type: "error",
            reason,
        }),
    };

    encoded.map_err(ActionCableError::Encode)
}

/// ActionCable protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ActionCableError {
    #[error("failed to parse command: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}
