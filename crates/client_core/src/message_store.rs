use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::domain::{
    ChatMessage, ConversationKey, DeliveryStatus, IncomingMessage, MessageKey, TempId, UserId,
};
use tracing::debug;

use crate::error::ClientError;

/// Outcome of merging one incoming record into the open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Not part of the open conversation (or none is open).
    OutOfScope,
    /// Matched an existing entry by id or temp id and replaced it in place.
    /// `superseded` lists the keys that no longer exist after the merge.
    Replaced {
        index: usize,
        superseded: Vec<MessageKey>,
    },
    /// Same content signature as the existing entry `of`; dropped.
    Duplicate { of: MessageKey },
    Appended {
        index: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Signature<'a> {
    sender: &'a UserId,
    recipient: &'a UserId,
    content: &'a str,
    bucket: i64,
}

#[derive(Debug)]
struct Conversation {
    key: ConversationKey,
    peer: UserId,
    messages: Vec<ChatMessage>,
    history_loaded: bool,
}

/// Ordered message log of the open conversation.
///
/// Every record, whether fetched, pushed or inserted optimistically, goes
/// through [`MessageStore::reconcile`]; nothing else edits the list.
#[derive(Debug)]
pub struct MessageStore {
    local_user: UserId,
    dedup_window_ms: i64,
    conversation: Option<Conversation>,
}

impl MessageStore {
    pub fn new(local_user: UserId, dedup_window: Duration) -> Self {
        let dedup_window_ms = i64::try_from(dedup_window.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Self {
            local_user,
            dedup_window_ms,
            conversation: None,
        }
    }

    pub fn open(&mut self, peer: UserId) {
        if self.peer() == Some(&peer) {
            return;
        }
        self.conversation = Some(Conversation {
            key: ConversationKey::new(self.local_user.clone(), peer.clone()),
            peer,
            messages: Vec::new(),
            history_loaded: false,
        });
    }

    /// Tears down the open conversation, returning its peer.
    pub fn close(&mut self) -> Option<UserId> {
        self.conversation.take().map(|conversation| conversation.peer)
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.conversation.as_ref().map(|conversation| &conversation.peer)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn is_history_loaded(&self) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|conversation| conversation.history_loaded)
    }

    /// Empties the list while keeping the conversation open.
    pub fn clear(&mut self) {
        if let Some(conversation) = &mut self.conversation {
            conversation.messages.clear();
        }
    }

    /// The optimistic entry for `temp_id`, while it has not been promoted to
    /// a server id.
    pub fn pending(&self, temp_id: &TempId) -> Option<&ChatMessage> {
        self.messages()
            .iter()
            .find(|message| message.key.temp_id() == Some(temp_id))
    }

    pub fn append_optimistic(
        &mut self,
        temp_id: TempId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let conversation = self
            .conversation
            .as_mut()
            .ok_or(ClientError::NoConversation)?;

        let message = ChatMessage {
            key: MessageKey::Temp(temp_id),
            sender: self.local_user.clone(),
            recipient: conversation.peer.clone(),
            content: content.to_string(),
            created_at: now,
        };
        conversation.messages.push(message.clone());
        Ok(message)
    }

    /// Merges one record: scope check, then exact id / temp id match
    /// (replace in place), then content signature (drop), else append.
    ///
    /// Two distinct messages with identical text from the same sender inside
    /// one dedup window collapse into one entry.
    pub fn reconcile(&mut self, incoming: &IncomingMessage) -> Reconciled {
        let dedup_window_ms = self.dedup_window_ms;
        let Some(conversation) = self.conversation.as_mut() else {
            return Reconciled::OutOfScope;
        };
        let message = &incoming.message;
        if !conversation
            .key
            .includes(&message.sender, &message.recipient)
        {
            return Reconciled::OutOfScope;
        }

        let matches: Vec<usize> = conversation
            .messages
            .iter()
            .enumerate()
            .filter(|(_, existing)| same_identity(existing, incoming))
            .map(|(index, _)| index)
            .collect();

        if let Some((&index, rest)) = matches.split_first() {
            let mut superseded = Vec::new();
            // Later matches are the same logical message under another id.
            for &extra in rest.iter().rev() {
                superseded.push(conversation.messages.remove(extra).key);
            }
            let previous = std::mem::replace(&mut conversation.messages[index], message.clone());
            if previous.key != message.key {
                superseded.push(previous.key);
            }
            debug!(key = %message.key, index, "store: replaced in place");
            return Reconciled::Replaced { index, superseded };
        }

        let incoming_signature = signature(message, dedup_window_ms);
        if let Some(existing) = conversation
            .messages
            .iter()
            .find(|existing| signature(existing, dedup_window_ms) == incoming_signature)
        {
            debug!(key = %message.key, of = %existing.key, "store: dropped duplicate by content signature");
            return Reconciled::Duplicate {
                of: existing.key.clone(),
            };
        }

        conversation.messages.push(message.clone());
        let index = conversation.messages.len() - 1;
        debug!(key = %message.key, index, "store: appended");
        Reconciled::Appended { index }
    }

    /// Rebuilds the list from a history batch for `peer`.
    ///
    /// The batch is reconciled into an empty list first; entries that were
    /// already present (optimistic sends, pushes that raced the fetch) are then
    /// reconciled on top, so the outcome does not depend on whether the fetch
    /// or the push landed first. Returns `None` if `peer` is no longer open,
    /// otherwise each reconciled record's key with its outcome.
    pub fn load_history(
        &mut self,
        peer: &UserId,
        batch: &[IncomingMessage],
    ) -> Option<Vec<(MessageKey, Reconciled)>> {
        let conversation = self.conversation.as_mut()?;
        if &conversation.peer != peer {
            return None;
        }
        let pending = std::mem::take(&mut conversation.messages);
        conversation.history_loaded = true;

        let mut outcomes = Vec::with_capacity(batch.len() + pending.len());
        for item in batch {
            outcomes.push((item.message.key.clone(), self.reconcile(item)));
        }
        for message in pending {
            let replay = IncomingMessage {
                temp_id: message.key.temp_id().cloned(),
                message,
                status: None,
            };
            outcomes.push((replay.message.key.clone(), self.reconcile(&replay)));
        }
        Some(outcomes)
    }

    /// Statuses implied by a history batch for the entries now in the list:
    /// the status the service reported, raised to `delivered` for our own
    /// messages when the peer was online at fetch time.
    pub fn append_delivered_set_from_history(
        &self,
        batch: &[IncomingMessage],
        peer_online: bool,
    ) -> Vec<(MessageKey, DeliveryStatus)> {
        let messages = self.messages();
        batch
            .iter()
            .filter(|item| {
                messages
                    .iter()
                    .any(|existing| existing.key == item.message.key)
            })
            .filter_map(|item| {
                let mut status = item.status.unwrap_or_default();
                if peer_online && item.message.sender == self.local_user {
                    status = status.advance(DeliveryStatus::Delivered);
                }
                (status > DeliveryStatus::Sent).then(|| (item.message.key.clone(), status))
            })
            .collect()
    }
}

fn same_identity(existing: &ChatMessage, incoming: &IncomingMessage) -> bool {
    if let (Some(existing_id), Some(incoming_id)) =
        (existing.key.server_id(), incoming.message.key.server_id())
    {
        if existing_id == incoming_id {
            return true;
        }
    }
    match (existing.key.temp_id(), incoming.temp_id.as_ref()) {
        (Some(existing_temp), Some(incoming_temp)) => existing_temp == incoming_temp,
        _ => false,
    }
}

fn signature(message: &ChatMessage, window_ms: i64) -> Signature<'_> {
    Signature {
        sender: &message.sender,
        recipient: &message.recipient,
        content: &message.content,
        bucket: message.created_at.timestamp_millis().div_euclid(window_ms),
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
