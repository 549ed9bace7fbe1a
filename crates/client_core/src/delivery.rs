use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatMessage, DeliveryStatus, MessageId, MessageKey, UserId},
    protocol::ClientEmit,
};
use tracing::debug;

/// Single writer of message delivery status.
///
/// Statuses are keyed by message key rather than stored on the messages, so a
/// receipt for an id the store has not seen yet is simply kept until the
/// message shows up.
#[derive(Debug)]
pub struct DeliveryTracker {
    local_user: UserId,
    statuses: HashMap<MessageKey, DeliveryStatus>,
    /// Newest `created_at` known read, per (sender, recipient).
    read_boundaries: HashMap<(UserId, UserId), DateTime<Utc>>,
}

impl DeliveryTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            statuses: HashMap::new(),
            read_boundaries: HashMap::new(),
        }
    }

    pub fn status(&self, key: &MessageKey) -> DeliveryStatus {
        self.statuses.get(key).copied().unwrap_or_default()
    }

    /// Raises the status of `key`; returns `true` if it moved forward.
    pub fn observe(&mut self, key: &MessageKey, status: DeliveryStatus) -> bool {
        let current = self.status(key);
        let next = current.advance(status);
        if next == current {
            return false;
        }
        debug!(key = %key, ?current, ?next, "delivery: status advanced");
        self.statuses.insert(key.clone(), next);
        true
    }

    pub fn mark_delivered(&mut self, message_id: &MessageId) -> bool {
        self.observe(
            &MessageKey::Server(message_id.clone()),
            DeliveryStatus::Delivered,
        )
    }

    /// Applies a per-direction read receipt to every known message from
    /// `from` to `to`. Returns how many entries moved to `read`.
    pub fn mark_read_direction(
        &mut self,
        from: &UserId,
        to: &UserId,
        messages: &[ChatMessage],
    ) -> usize {
        let mut advanced = 0;
        for message in messages
            .iter()
            .filter(|message| &message.sender == from && &message.recipient == to)
        {
            if self.observe(&message.key, DeliveryStatus::Read) {
                advanced += 1;
            }
            self.raise_read_boundary(from, to, message.created_at);
        }
        advanced
    }

    /// Carries the status of keys that disappeared in a merge over to the
    /// surviving key.
    pub fn rekey(&mut self, superseded: &MessageKey, current: &MessageKey) {
        if superseded == current {
            return;
        }
        if let Some(status) = self.statuses.remove(superseded) {
            self.observe(current, status);
        }
    }

    /// Called for every message that enters the list; a message older than a
    /// read receipt already seen for its direction is read on arrival.
    pub fn track(&mut self, message: &ChatMessage) -> bool {
        let direction = (message.sender.clone(), message.recipient.clone());
        match self.read_boundaries.get(&direction) {
            Some(boundary) if message.created_at <= *boundary => {
                self.observe(&message.key, DeliveryStatus::Read)
            }
            _ => false,
        }
    }

    /// Emits `read-messages` when the open conversation holds a message from
    /// `peer` to us that is not yet read. Those messages are marked read, so
    /// an immediate second check emits nothing.
    pub fn read_receipt_due(
        &mut self,
        peer: &UserId,
        messages: &[ChatMessage],
    ) -> Option<ClientEmit> {
        let local_user = self.local_user.clone();
        let unread = messages
            .iter()
            .filter(|message| &message.sender == peer && message.recipient == local_user)
            .any(|message| self.status(&message.key) < DeliveryStatus::Read);
        if !unread {
            return None;
        }
        let marked = self.mark_read_direction(peer, &local_user, messages);
        debug!(peer = %peer, marked, "delivery: read receipt due");
        Some(ClientEmit::read_messages(peer, &local_user))
    }

    pub fn reset(&mut self) {
        self.statuses.clear();
        self.read_boundaries.clear();
    }

    fn raise_read_boundary(&mut self, from: &UserId, to: &UserId, at: DateTime<Utc>) {
        let boundary = self
            .read_boundaries
            .entry((from.clone(), to.clone()))
            .or_insert(at);
        if at > *boundary {
            *boundary = at;
        }
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
