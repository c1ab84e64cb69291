//! Connection session management
//!
//! A session represents a single client connection: its subscriptions and
//! the presence it declared in each stream. [`SessionHooks`] are the
//! extension points the server calls at fixed moments of a session's life.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::actioncable::ClientCommand;
use crate::presence::{JoinOutcome, PresenceError, PresenceRegistry};

/// Connection session
#[derive(Debug)]
pub struct Session {
    /// Unique connection ID
    pub conn_id: u64,
    /// Session ID sent in `welcome`; default presence ID
    pub sid: String,
    /// Subscribed identifiers -> resolved stream
    subscriptions: HashMap<String, String>,
    /// Stream -> presence ID this session joined with
    presence: HashMap<String, String>,
}

impl Session {
    pub fn new(conn_id: u64) -> Self {
        Self {
            conn_id,
            sid: format!("s{conn_id}"),
            subscriptions: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    /// Subscribe to a stream under the given identifier
    pub fn subscribe(&mut self, identifier: String, stream: String) {
        self.subscriptions.insert(identifier, stream);
    }

    /// Unsubscribe, returning the stream the identifier pointed to
    pub fn unsubscribe(&mut self, identifier: &str) -> Option<String> {
        self.subscriptions.remove(identifier)
    }

    /// Stream for a subscribed identifier
    pub fn stream_for(&self, identifier: &str) -> Option<&str> {
        self.subscriptions.get(identifier).map(String::as_str)
    }

    /// Whether another identifier still points at the stream
    pub fn is_subscribed_to_stream(&self, stream: &str) -> bool {
        self.subscriptions.values().any(|s| s == stream)
    }

    /// Record presence in a stream, returning the previous presence ID if it differs
    pub fn set_presence(&mut self, stream: &str, id: &str) -> Option<String> {
        self.presence
            .insert(stream.to_string(), id.to_string())
            .filter(|previous| previous != id)
    }

    /// Forget presence in a stream, returning the presence ID
    pub fn take_presence(&mut self, stream: &str) -> Option<String> {
        self.presence.remove(stream)
    }

    /// (stream, presence ID) pairs this session joined
    pub fn presence_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.presence
            .iter()
            .map(|(stream, id)| (stream.as_str(), id.as_str()))
    }
}

/// Session lifecycle extension points
///
/// Called synchronously by the server: after the welcome is sent, after each
/// command has been handled, and once the connection is gone.
pub trait SessionHooks: Send + Sync {
    fn on_open(&self, _session: &Session) {}

    fn after_command(&self, _session: &Session, _command: &ClientCommand) {}

    fn on_close(&self, _session: &Session) {}
}

/// Presence shared by the sessions of one user
///
/// A presence ID can be held by several sessions at once (one user, two
/// tabs). The registry only sees a leave once the last of them has gone.
pub struct SessionPresence {
    registry: PresenceRegistry,
    /// (stream, presence ID) -> connections holding it
    holders: DashMap<(String, String), HashSet<u64>>,
}

impl SessionPresence {
    pub fn new(registry: PresenceRegistry) -> Self {
        Self {
            registry,
            holders: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Join `stream` as `id` on behalf of connection `conn_id`
    pub fn join(
        &self,
        conn_id: u64,
        stream: &str,
        id: &str,
        info: serde_json::Value,
    ) -> Result<JoinOutcome, PresenceError> {
        let key = (stream.to_string(), id.to_string());

        // Held across the registry call so a racing last leave cannot undo this join
        let mut holders = self.holders.entry(key.clone()).or_default();
        match self.registry.join(stream, id, info) {
            Ok(outcome) => {
                holders.insert(conn_id);
                Ok(outcome)
            }
            Err(e) => {
                drop(holders);
                self.holders.remove_if(&key, |_, h| h.is_empty());
                Err(e)
            }
        }
    }

    /// Release `id` in `stream` for connection `conn_id`.
    ///
    /// The registry leave (with `delay`) only happens when no other
    /// connection holds the ID; returns whether it happened and the member existed.
    pub fn leave(
        &self,
        conn_id: u64,
        stream: &str,
        id: &str,
        delay: Option<Duration>,
    ) -> Result<bool, PresenceError> {
        match self.holders.entry((stream.to_string(), id.to_string())) {
            Entry::Occupied(mut holders) => {
                holders.get_mut().remove(&conn_id);
                if !holders.get().is_empty() {
                    debug!(
                        conn_id,
                        stream,
                        presence_id = id,
                        remaining = holders.get().len(),
                        "presence kept by other sessions"
                    );
                    return Ok(false);
                }

                let result = self.registry.leave(stream, id, delay);
                holders.remove();
                result
            }
            Entry::Vacant(_) => self.registry.leave(stream, id, delay),
        }
    }

    /// Number of connections holding `id` in `stream`
    pub fn holder_count(&self, stream: &str, id: &str) -> usize {
        self.holders
            .get(&(stream.to_string(), id.to_string()))
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

impl SessionHooks for SessionPresence {
    /// Release every joined stream; last holders leave after the grace period
    fn on_close(&self, session: &Session) {
        for (stream, id) in session.presence_entries() {
            match self.leave(session.conn_id, stream, id, None) {
                Ok(left) => {
                    debug!(
                        conn_id = session.conn_id,
                        stream,
                        presence_id = id,
                        left,
                        "presence released on close"
                    );
                }
                Err(PresenceError::Disabled) => {}
                Err(e) => {
                    warn!(
                        conn_id = session.conn_id,
                        stream,
                        error = %e,
                        "presence leave on close failed"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPresence")
            .field("held", &self.holders.len())
            .finish()
    }
}
