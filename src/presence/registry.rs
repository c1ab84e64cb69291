//! Presence registry
//!
//! Maps stream keys to [`PresenceSet`]s. Each set sits behind its own mutex
//! so unrelated streams never contend; the table itself is a sharded
//! `DashMap`. Sets are created on first join and unlinked as soon as they
//! become empty.
//!
//! Lock order: a set lock may be held while touching the table (to unlink
//! an empty set), never the other way around.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::publisher::EventPublisher;
use super::scheduler::ExpiryScheduler;
use super::set::{MarkLeaving, PresenceSet};
use super::{Member, PresenceError, PresenceEvent, now_millis};
use crate::config::PresenceConfig;
use crate::pubsub::PubSub;

type SharedSet = Arc<Mutex<PresenceSet>>;

/// Result of a join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// True if this join started a new presence episode
    pub is_new: bool,
    /// Members of the stream in join order, including the joiner
    pub members: Vec<Member>,
}

/// Process-wide presence table
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    sets: DashMap<String, SharedSet>,
    scheduler: ExpiryScheduler,
    publisher: EventPublisher,
    config: PresenceConfig,
}

impl PresenceRegistry {
    /// Create a registry publishing events through `pubsub`.
    ///
    /// Must be called from within a Tokio runtime: the event dispatcher and
    /// all grace-period timers run on it.
    pub fn new(config: PresenceConfig, pubsub: Arc<dyn PubSub>) -> Self {
        let publisher = EventPublisher::new(pubsub, config.queue_capacity, config.notify_timeout);

        Self {
            inner: Arc::new(Inner {
                sets: DashMap::new(),
                scheduler: ExpiryScheduler::new(),
                publisher,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Add `id` to `stream`, or refresh its info if already present.
    ///
    /// A refresh cancels a pending leave and emits nothing.
    pub fn join(
        &self,
        stream: &str,
        id: &str,
        info: serde_json::Value,
    ) -> Result<JoinOutcome, PresenceError> {
        self.check(stream, id)?;
        let inner = &self.inner;

        let outcome = inner.with_set(stream, true, |set| {
            let is_new = set.join(id, info, now_millis());
            let members = set.members();

            if is_new {
                if let Some(member) = members.iter().find(|m| m.id == id) {
                    inner.publisher.notify(stream, PresenceEvent::join(member));
                }
                debug!(stream, presence_id = id, total = set.len(), "presence joined");
            } else {
                debug!(stream, presence_id = id, "presence refreshed");
            }

            JoinOutcome { is_new, members }
        });

        Ok(outcome.unwrap_or_else(|| JoinOutcome {
            is_new: false,
            members: Vec::new(),
        }))
    }

    /// Remove `id` from `stream`, immediately or after a grace period.
    ///
    /// `None` uses the configured grace period for the stream. A zero delay
    /// removes now; a positive delay arms (or re-arms) a timer. Returns
    /// whether the member existed.
    pub fn leave(
        &self,
        stream: &str,
        id: &str,
        delay: Option<Duration>,
    ) -> Result<bool, PresenceError> {
        self.check(stream, id)?;
        let delay = delay.unwrap_or_else(|| self.inner.config.grace_period_for(stream));

        let existed = if delay.is_zero() {
            self.inner.remove_now(stream, id)
        } else {
            self.schedule_leave(stream, id, delay)
        };

        Ok(existed)
    }

    /// Members of `stream` in join order, pending leaves included
    pub fn members_of(&self, stream: &str) -> Vec<Member> {
        self.inner
            .with_set(stream, false, |set| set.members())
            .unwrap_or_default()
    }

    /// Whether `id` is waiting out its grace period in `stream`
    pub fn is_pending(&self, stream: &str, id: &str) -> bool {
        self.inner
            .with_set(stream, false, |set| set.is_pending(id))
            .unwrap_or(false)
    }

    /// Number of members of `stream` waiting out a grace period
    pub fn pending_count(&self, stream: &str) -> usize {
        self.inner
            .with_set(stream, false, |set| set.pending_count())
            .unwrap_or(0)
    }

    /// Number of streams with at least one member
    pub fn stream_count(&self) -> usize {
        self.inner.sets.len()
    }

    /// Remove every member of every stream, emitting leave events.
    ///
    /// Returns the number of members removed.
    pub fn drain(&self) -> usize {
        let streams: Vec<String> = self.inner.sets.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;

        for stream in streams {
            removed += self
                .inner
                .with_set(&stream, false, |set| {
                    let members = set.clear();
                    for member in &members {
                        self.inner
                            .publisher
                            .notify(&stream, PresenceEvent::leave(member));
                    }
                    members.len()
                })
                .unwrap_or(0);
        }

        debug!(removed, "presence drained");
        removed
    }

    /// Drain all streams and wait for the final events to be handed off.
    ///
    /// Best effort: returns false if the queue did not empty within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.drain();
        self.inner.publisher.flush(timeout).await
    }

    /// Wait until all events emitted so far have been handed to the transport
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.inner.publisher.flush(timeout).await
    }

    /// Number of events dropped because the transport fell behind
    pub fn dropped_events(&self) -> u64 {
        self.inner.publisher.dropped()
    }

    fn check(&self, stream: &str, id: &str) -> Result<(), PresenceError> {
        if !self.inner.config.enabled {
            return Err(PresenceError::Disabled);
        }
        if stream.is_empty() {
            return Err(PresenceError::InvalidArgument("stream must not be empty"));
        }
        if id.is_empty() {
            return Err(PresenceError::InvalidArgument("id must not be empty"));
        }
        Ok(())
    }

    fn schedule_leave(&self, stream: &str, id: &str, delay: Duration) -> bool {
        let inner = &self.inner;
        let weak: Weak<Inner> = Arc::downgrade(inner);

        inner
            .with_set(stream, false, |set| {
                if !set.contains(id) {
                    return false;
                }

                let fire_stream = stream.to_string();
                let fire_id = id.to_string();
                let timer = inner.scheduler.arm(delay, move |generation| {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&fire_stream, &fire_id, generation);
                    }
                });

                match set.mark_leaving(id, timer) {
                    MarkLeaving::Armed => {
                        debug!(
                            stream,
                            presence_id = id,
                            delay_ms = delay.as_millis() as u64,
                            "presence leave scheduled"
                        );
                        true
                    }
                    MarkLeaving::Unknown(timer) => {
                        timer.cancel();
                        false
                    }
                }
            })
            .unwrap_or(false)
    }
}

impl Inner {
    /// Run `f` on the set for `stream` under its lock, then unlink the set if empty.
    ///
    /// Returns None if the stream has no set and `create` is false.
    fn with_set<R>(
        &self,
        stream: &str,
        create: bool,
        f: impl FnOnce(&mut PresenceSet) -> R,
    ) -> Option<R> {
        loop {
            let shared = if create {
                self.sets
                    .entry(stream.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(PresenceSet::new())))
                    .clone()
            } else {
                self.sets.get(stream)?.clone()
            };

            let mut set = lock(&shared);
            if set.is_retired() {
                // Unlinked between lookup and lock; look again
                drop(set);
                self.sets.remove_if(stream, |_, s| Arc::ptr_eq(s, &shared));
                continue;
            }

            let result = f(&mut set);

            if set.is_empty() {
                set.retire();
                self.sets.remove_if(stream, |_, s| Arc::ptr_eq(s, &shared));
                debug!(stream, "presence set removed");
            }

            return Some(result);
        }
    }

    fn remove_now(&self, stream: &str, id: &str) -> bool {
        self.with_set(stream, false, |set| match set.remove(id) {
            Some(member) => {
                self.publisher.notify(stream, PresenceEvent::leave(&member));
                debug!(stream, presence_id = id, "presence left");
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    fn expire(&self, stream: &str, id: &str, generation: u64) {
        let expired = self.with_set(stream, false, |set| match set.expire(id, generation) {
            Some(member) => {
                self.publisher.notify(stream, PresenceEvent::leave(&member));
                true
            }
            None => false,
        });

        match expired {
            Some(true) => debug!(stream, presence_id = id, "presence expired"),
            _ => debug!(stream, presence_id = id, generation, "stale presence timer ignored"),
        }
    }
}

fn lock(set: &SharedSet) -> MutexGuard<'_, PresenceSet> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("streams", &self.inner.sets.len())
            .field("publisher", &self.inner.publisher)
            .finish()
    }
}
