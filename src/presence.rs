//! Presence tracking for OrbitCast
//!
//! Tracks who is currently present in each stream. Members join and leave
//! explicitly; disconnects leave after a grace period so that a page reload
//! or a short network blip does not flicker the member list.
//!
//! ## Layout
//!
//! - [`PresenceRegistry`] - stream -> [`set::PresenceSet`] table, the public entry point
//! - [`set::PresenceSet`] - ordered members of one stream
//! - [`ExpiryScheduler`] - deferred-leave timers
//! - [`EventPublisher`] - ordered, non-blocking hand-off of join/leave events
//!   to a [`PubSub`](crate::pubsub::PubSub)
//!
//! Compatible with AnyCable's presence event format.

mod publisher;
mod registry;
mod scheduler;
mod set;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use publisher::EventPublisher;
pub use registry::{JoinOutcome, PresenceRegistry};
pub use scheduler::{ArmedTimer, ExpiryScheduler};

/// Presence event types
pub const PRESENCE_JOIN: &str = "join";
pub const PRESENCE_LEAVE: &str = "leave";
pub const PRESENCE_INFO: &str = "info";

/// A member present in a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Presence ID (user identifier, not connection ID)
    pub id: String,
    /// Caller-provided info (name, avatar, etc.), replaced on every join
    pub info: serde_json::Value,
    /// Unix milliseconds at the start of this presence episode
    pub joined_at: i64,
}

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Join,
    Leave,
}

impl PresenceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceEventKind::Join => PRESENCE_JOIN,
            PresenceEventKind::Leave => PRESENCE_LEAVE,
        }
    }
}

/// Presence event to broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "type")]
    pub kind: PresenceEventKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl PresenceEvent {
    pub fn join(member: &Member) -> Self {
        Self {
            kind: PresenceEventKind::Join,
            id: member.id.clone(),
            info: Some(member.info.clone()),
        }
    }

    pub fn leave(member: &Member) -> Self {
        Self {
            kind: PresenceEventKind::Leave,
            id: member.id.clone(),
            info: None,
        }
    }
}

/// Presence info response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceInfo {
    #[serde(rename = "type")]
    pub info_type: String,
    pub total: usize,
    pub records: Vec<PresenceInfoRecord>,
}

/// A record in presence info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceInfoRecord {
    pub id: String,
    pub info: serde_json::Value,
}

impl PresenceInfo {
    pub fn from_members(members: &[Member]) -> Self {
        let records: Vec<PresenceInfoRecord> = members
            .iter()
            .map(|m| PresenceInfoRecord {
                id: m.id.clone(),
                info: m.info.clone(),
            })
            .collect();

        Self {
            info_type: PRESENCE_INFO.to_string(),
            total: records.len(),
            records,
        }
    }
}

/// Presence errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("presence is disabled")]
    Disabled,
}

/// Current wall-clock time in unix milliseconds
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_event_serialization() {
        let member = Member {
            id: "user_42".to_string(),
            info: serde_json::json!({"name": "Marissa"}),
            joined_at: 0,
        };
        let json = serde_json::to_value(PresenceEvent::join(&member)).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["id"], "user_42");
        assert_eq!(json["info"]["name"], "Marissa");
    }

    #[test]
    fn test_leave_event_omits_info() {
        let member = Member {
            id: "user_42".to_string(),
            info: serde_json::json!({"name": "Marissa"}),
            joined_at: 0,
        };
        let json = serde_json::to_value(PresenceEvent::leave(&member)).unwrap();
        assert_eq!(json["type"], "leave");
        assert!(json.get("info").is_none());
    }

    #[test]
    fn test_presence_info_from_members() {
        let members = vec![
            Member {
                id: "a".to_string(),
                info: serde_json::Value::Null,
                joined_at: 1,
            },
            Member {
                id: "b".to_string(),
                info: serde_json::json!({"x": 1}),
                joined_at: 2,
            },
        ];
        let info = PresenceInfo::from_members(&members);
        assert_eq!(info.info_type, PRESENCE_INFO);
        assert_eq!(info.total, 2);
        assert_eq!(info.records[1].id, "b");
    }
}
