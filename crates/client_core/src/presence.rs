use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::ServerEvent};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
    /// No usable roster has been received (or the last one was malformed).
    Unknown,
}

/// Session-wide view of who is online, fed by roster broadcasts and
/// last-seen upserts.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    roster: Option<HashSet<UserId>>,
    last_seen: HashMap<UserId, DateTime<Utc>>,
    stale: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes presence events; returns `true` when the event was one of ours.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::OnlineUsers(users) => {
                self.replace_roster(users.iter().cloned());
                true
            }
            ServerEvent::RosterMalformed => {
                self.mark_roster_unknown();
                true
            }
            ServerEvent::LastSeen { user_id, at } => {
                self.record_last_seen(user_id.clone(), *at);
                true
            }
            _ => false,
        }
    }

    pub fn replace_roster(&mut self, users: impl IntoIterator<Item = UserId>) {
        let roster: HashSet<UserId> = users.into_iter().collect();
        debug!(online = roster.len(), "presence: roster replaced");
        self.roster = Some(roster);
        self.stale = false;
    }

    pub fn mark_roster_unknown(&mut self) {
        warn!("presence: malformed roster, falling back to unknown");
        self.roster = None;
    }

    pub fn record_last_seen(&mut self, user_id: UserId, at: DateTime<Utc>) {
        self.last_seen.insert(user_id, at);
    }

    /// While the stream is down the last roster is kept but flagged.
    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn presence(&self, user_id: &UserId) -> Presence {
        match &self.roster {
            Some(roster) if roster.contains(user_id) => Presence::Online,
            Some(_) => Presence::Offline,
            None => Presence::Unknown,
        }
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.presence(user_id) == Presence::Online
    }

    /// Last-seen time, only reported while the user is not online.
    pub fn last_seen(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        if self.is_online(user_id) {
            return None;
        }
        self.last_seen.get(user_id).copied()
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
