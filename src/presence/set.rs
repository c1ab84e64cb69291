//! Members of a single stream
//!
//! Not exposed outside the presence module: every mutation goes through the
//! registry so that event emission stays in step with state transitions.

use std::collections::{BTreeMap, HashMap};

use super::Member;
use super::scheduler::ArmedTimer;

/// Whether a member is simply present or waiting out a grace period
#[derive(Debug)]
enum EntryState {
    Present,
    Leaving(ArmedTimer),
}

#[derive(Debug)]
struct Entry {
    member: Member,
    seq: u64,
    state: EntryState,
}

/// Result of marking a member as leaving
#[derive(Debug)]
pub(crate) enum MarkLeaving {
    /// Member is now pending removal
    Armed,
    /// No such member, the unused timer is handed back
    Unknown(ArmedTimer),
}

/// Ordered presence set for one stream
///
/// Members are ordered by join sequence; a refresh keeps the original
/// position. A member waiting out its grace period is still listed.
#[derive(Debug, Default)]
pub(crate) struct PresenceSet {
    entries: HashMap<String, Entry>,
    /// join sequence -> presence id
    order: BTreeMap<u64, String>,
    next_seq: u64,
    /// Set once the registry has unlinked this set; holders must look it up again
    retired: bool,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a member. Returns true if this started a new presence episode.
    pub fn join(&mut self, id: &str, info: serde_json::Value, now: i64) -> bool {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.member.info = info;
            if let EntryState::Leaving(timer) =
                std::mem::replace(&mut entry.state, EntryState::Present)
            {
                timer.cancel();
            }
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.to_string());
        self.entries.insert(
            id.to_string(),
            Entry {
                member: Member {
                    id: id.to_string(),
                    info,
                    joined_at: now,
                },
                seq,
                state: EntryState::Present,
            },
        );
        true
    }

    /// Put a member into its grace period, replacing any timer already armed
    pub fn mark_leaving(&mut self, id: &str, timer: ArmedTimer) -> MarkLeaving {
        match self.entries.get_mut(id) {
            Some(entry) => {
                if let EntryState::Leaving(previous) =
                    std::mem::replace(&mut entry.state, EntryState::Leaving(timer))
                {
                    previous.cancel();
                }
                MarkLeaving::Armed
            }
            None => MarkLeaving::Unknown(timer),
        }
    }

    /// Remove a member now, cancelling its timer if one is armed
    pub fn remove(&mut self, id: &str) -> Option<Member> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.seq);
        if let EntryState::Leaving(timer) = entry.state {
            timer.cancel();
        }
        Some(entry.member)
    }

    /// Remove a member whose timer of the given generation fired.
    ///
    /// Returns None if the member is gone, was re-joined, or has been re-armed since.
    pub fn expire(&mut self, id: &str, generation: u64) -> Option<Member> {
        let matches = matches!(
            self.entries.get(id),
            Some(Entry {
                state: EntryState::Leaving(timer),
                ..
            }) if timer.generation() == generation
        );
        if !matches {
            return None;
        }

        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.seq);
        Some(entry.member)
    }

    /// Remove every member, cancelling armed timers
    pub fn clear(&mut self) -> Vec<Member> {
        let order = std::mem::take(&mut self.order);
        order
            .into_values()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| {
                if let EntryState::Leaving(timer) = entry.state {
                    timer.cancel();
                }
                entry.member
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        matches!(
            self.entries.get(id),
            Some(Entry {
                state: EntryState::Leaving(_),
                ..
            })
        )
    }

    /// Members in join order
    pub fn members(&self) -> Vec<Member> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.state, EntryState::Leaving(_)))
            .count()
    }

    /// No members and therefore no armed timers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn retire(&mut self) {
        self.retired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::ExpiryScheduler;
    use serde_json::json;
    use std::time::Duration;

    fn ids(set: &PresenceSet) -> Vec<String> {
        set.members().into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_join_orders_by_sequence() {
        let mut set = PresenceSet::new();
        assert!(set.join("b", json!(null), 10));
        assert!(set.join("a", json!(null), 10));
        assert!(set.join("c", json!(null), 5));

        assert_eq!(ids(&set), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_refresh_replaces_info_and_keeps_position() {
        let mut set = PresenceSet::new();
        set.join("u1", json!({"name": "A", "avatar": "x.png"}), 1);
        set.join("u2", json!(null), 2);

        assert!(!set.join("u1", json!({"name": "B"}), 3));

        let members = set.members();
        assert_eq!(members[0].id, "u1");
        assert_eq!(members[0].info, json!({"name": "B"}));
        assert_eq!(members[0].joined_at, 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_rejoin_after_remove_moves_to_end() {
        let mut set = PresenceSet::new();
        set.join("u1", json!(null), 1);
        set.join("u2", json!(null), 2);
        assert!(set.remove("u1").is_some());
        assert!(set.join("u1", json!(null), 3));

        assert_eq!(ids(&set), vec!["u2", "u1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_member_still_listed() {
        let scheduler = ExpiryScheduler::new();
        let mut set = PresenceSet::new();
        set.join("u1", json!(null), 1);

        let timer = scheduler.arm(Duration::from_secs(5), |_| {});
        assert!(matches!(set.mark_leaving("u1", timer), MarkLeaving::Armed));

        assert!(set.contains("u1"));
        assert!(set.is_pending("u1"));
        assert_eq!(set.pending_count(), 1);
        assert_eq!(ids(&set), vec!["u1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_requires_matching_generation() {
        let scheduler = ExpiryScheduler::new();
        let mut set = PresenceSet::new();
        set.join("u1", json!(null), 1);

        let first = scheduler.arm(Duration::from_secs(5), |_| {});
        let stale = first.generation();
        set.mark_leaving("u1", first);

        let second = scheduler.arm(Duration::from_secs(5), |_| {});
        let current = second.generation();
        set.mark_leaving("u1", second);

        assert!(set.expire("u1", stale).is_none());
        assert!(set.contains("u1"));
        assert!(set.expire("u1", current).is_some());
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_pending() {
        let scheduler = ExpiryScheduler::new();
        let mut set = PresenceSet::new();
        set.join("u1", json!(null), 1);

        let timer = scheduler.arm(Duration::from_secs(5), |_| {});
        let generation = timer.generation();
        set.mark_leaving("u1", timer);

        assert!(!set.join("u1", json!(null), 2));
        assert!(!set.is_pending("u1"));
        assert!(set.expire("u1", generation).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_leaving_unknown_returns_timer() {
        let scheduler = ExpiryScheduler::new();
        let mut set = PresenceSet::new();
        let timer = scheduler.arm(Duration::from_secs(5), |_| {});

        assert!(matches!(
            set.mark_leaving("ghost", timer),
            MarkLeaving::Unknown(_)
        ));
    }

    #[test]
    fn test_clear_returns_members_in_order() {
        let mut set = PresenceSet::new();
        set.join("a", json!(null), 1);
        set.join("b", json!(null), 2);

        let removed: Vec<String> = set.clear().into_iter().map(|m| m.id).collect();
        assert_eq!(removed, vec!["a", "b"]);
        assert!(set.is_empty());
    }
}
