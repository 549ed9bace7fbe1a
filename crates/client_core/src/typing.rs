use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use shared::{domain::UserId, protocol::ClientEmit};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalTyping {
    Idle,
    Typing { peer: UserId, deadline: Instant },
}

/// Debounced local typing state plus the session-wide set of remote typers.
///
/// Outbound emits happen only on the `Idle -> Typing` and `Typing -> Idle`
/// edges, so one burst of keystrokes costs exactly two events.
#[derive(Debug)]
pub struct TypingCoordinator {
    local_user: UserId,
    idle_after: Duration,
    open_peer: Option<UserId>,
    local: LocalTyping,
    remote: HashSet<UserId>,
}

impl TypingCoordinator {
    pub fn new(local_user: UserId, idle_after: Duration) -> Self {
        Self {
            local_user,
            idle_after,
            open_peer: None,
            local: LocalTyping::Idle,
            remote: HashSet::new(),
        }
    }

    pub fn open_peer(&self) -> Option<&UserId> {
        self.open_peer.as_ref()
    }

    /// Moves to another conversation (or none). The returned `typing:false`
    /// belongs to the conversation being left and must be sent before
    /// anything for the new one.
    pub fn switch_conversation(&mut self, peer: Option<UserId>) -> Option<ClientEmit> {
        let flushed = self.flush();
        self.open_peer = peer;
        flushed
    }

    pub fn input_changed(&mut self, now: Instant) -> Option<ClientEmit> {
        let peer = self.open_peer.clone()?;
        let deadline = now + self.idle_after;
        match &mut self.local {
            LocalTyping::Typing {
                deadline: current, ..
            } => {
                *current = deadline;
                None
            }
            LocalTyping::Idle => {
                debug!(peer = %peer, "typing: started");
                let emit = ClientEmit::typing(&self.local_user, &peer, true);
                self.local = LocalTyping::Typing { peer, deadline };
                Some(emit)
            }
        }
    }

    /// Fires the idle edge once the debounce deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<ClientEmit> {
        match &self.local {
            LocalTyping::Typing { deadline, .. } if now >= *deadline => self.flush(),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.local {
            LocalTyping::Typing { deadline, .. } => Some(*deadline),
            LocalTyping::Idle => None,
        }
    }

    pub fn is_local_typing(&self) -> bool {
        matches!(self.local, LocalTyping::Typing { .. })
    }

    /// Forces `Typing -> Idle` immediately, clearing the timer.
    pub fn flush(&mut self) -> Option<ClientEmit> {
        match std::mem::replace(&mut self.local, LocalTyping::Idle) {
            LocalTyping::Typing { peer, .. } => {
                debug!(peer = %peer, "typing: stopped");
                Some(ClientEmit::typing(&self.local_user, &peer, false))
            }
            LocalTyping::Idle => None,
        }
    }

    /// Applies an inbound typing event; returns `true` if the set changed.
    pub fn apply_remote(&mut self, user_id: &UserId, is_typing: bool) -> bool {
        if user_id == &self.local_user {
            debug!("typing: ignoring echo of own typing event");
            return false;
        }
        if is_typing {
            self.remote.insert(user_id.clone())
        } else {
            self.remote.remove(user_id)
        }
    }

    /// Whether the UI may show "typing" for `user_id`: never for ourselves and
    /// never for a conversation that is not open.
    pub fn is_peer_typing(&self, user_id: &UserId) -> bool {
        user_id != &self.local_user
            && self.open_peer.as_ref() == Some(user_id)
            && self.remote.contains(user_id)
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
