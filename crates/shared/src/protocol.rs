use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChatMessage, DeliveryStatus, IncomingMessage, MessageId, MessageKey, TempId, UserId},
    error::ProtocolError,
};

/// Outbound stream frames. Serializes as `{"event": "<name>", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEmit {
    Join(UserId),
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
    ReadMessages(DirectionPayload),
}

impl ClientEmit {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::SendMessage(_) => "send-message",
            Self::Typing(_) => "typing",
            Self::ReadMessages(_) => "read-messages",
        }
    }

    pub fn typing(from: &UserId, to: &UserId, is_typing: bool) -> Self {
        Self::Typing(TypingPayload {
            from: from.clone(),
            to: to.clone(),
            is_typing,
        })
    }

    pub fn read_messages(from: &UserId, to: &UserId) -> Self {
        Self::ReadMessages(DirectionPayload {
            from: from.clone(),
            to: to.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub from: UserId,
    pub to: UserId,
    pub content: String,
    pub temp_id: TempId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub from: UserId,
    pub to: UserId,
    pub is_typing: bool,
}

/// One direction of a conversation, sender to recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionPayload {
    pub from: UserId,
    pub to: UserId,
}

/// Message record as both the stream and the history endpoint encode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    #[serde(alias = "from")]
    pub sender_id: UserId,
    #[serde(alias = "to", alias = "recipientId")]
    pub receiver_id: UserId,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

impl TryFrom<MessagePayload> for IncomingMessage {
    type Error = ProtocolError;

    fn try_from(payload: MessagePayload) -> Result<Self, Self::Error> {
        let key = match (payload.id, payload.temp_id.clone()) {
            (Some(id), _) => MessageKey::Server(id),
            (None, Some(temp_id)) => MessageKey::Temp(temp_id),
            (None, None) => {
                return Err(ProtocolError::payload(
                    "receive-message",
                    "message carries neither id nor tempId",
                ))
            }
        };
        Ok(IncomingMessage {
            message: ChatMessage {
                key,
                sender: payload.sender_id,
                recipient: payload.receiver_id,
                content: payload.content,
                created_at: payload.created_at,
            },
            temp_id: payload.temp_id,
            status: payload.status,
        })
    }
}

/// Body of the durable-storage submission sent alongside the stream emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub temp_id: TempId,
}

/// Inbound event names, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OnlineUsers,
    LastSeen,
    Typing,
    ReceiveMessage,
    Delivered,
    Read,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::OnlineUsers,
        EventKind::LastSeen,
        EventKind::Typing,
        EventKind::ReceiveMessage,
        EventKind::Delivered,
        EventKind::Read,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::OnlineUsers => "online-users",
            Self::LastSeen => "last-seen",
            Self::Typing => "typing",
            Self::ReceiveMessage => "receive-message",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Full roster of online users; replaces the previous one.
    OnlineUsers(Vec<UserId>),
    /// An `online-users` frame whose payload was not a list of ids.
    RosterMalformed,
    LastSeen {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    Typing {
        user_id: UserId,
        is_typing: bool,
    },
    ReceiveMessage(IncomingMessage),
    Delivered {
        message_id: MessageId,
    },
    Read {
        from: UserId,
        to: UserId,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OnlineUsers(_) | Self::RosterMalformed => EventKind::OnlineUsers,
            Self::LastSeen { .. } => EventKind::LastSeen,
            Self::Typing { .. } => EventKind::Typing,
            Self::ReceiveMessage(_) => EventKind::ReceiveMessage,
            Self::Delivered { .. } => EventKind::Delivered,
            Self::Read { .. } => EventKind::Read,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveredPayload {
    #[serde(alias = "id")]
    message_id: MessageId,
}

fn parse<T: serde::de::DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::payload(kind.name(), err))
}

/// Parses one text frame from the stream into a typed event.
///
/// Unknown event names and payloads of the wrong shape are rejected. The one
/// exception is `online-users`: a non-list roster decodes to
/// [`ServerEvent::RosterMalformed`] so presence can degrade to "unknown"
/// instead of keeping a roster that is known to be wrong.
pub fn decode_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let frame: Frame = serde_json::from_str(text)?;
    let kind = EventKind::from_name(&frame.event)
        .ok_or_else(|| ProtocolError::UnknownEvent(frame.event.clone()))?;

    match kind {
        EventKind::OnlineUsers => Ok(serde_json::from_value::<Vec<UserId>>(frame.data)
            .map(ServerEvent::OnlineUsers)
            .unwrap_or(ServerEvent::RosterMalformed)),
        EventKind::LastSeen => {
            let (user_id, WireTimestamp(at)) = parse(kind, frame.data)?;
            Ok(ServerEvent::LastSeen { user_id, at })
        }
        EventKind::Typing => {
            let (user_id, is_typing) = parse(kind, frame.data)?;
            Ok(ServerEvent::Typing { user_id, is_typing })
        }
        EventKind::ReceiveMessage => {
            let payload: MessagePayload = parse(kind, frame.data)?;
            Ok(ServerEvent::ReceiveMessage(payload.try_into()?))
        }
        EventKind::Delivered => {
            let payload: DeliveredPayload = parse(kind, frame.data)?;
            Ok(ServerEvent::Delivered {
                message_id: payload.message_id,
            })
        }
        EventKind::Read => {
            let DirectionPayload { from, to } = parse(kind, frame.data)?;
            Ok(ServerEvent::Read { from, to })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
struct WireTimestamp(#[serde(with = "timestamp")] DateTime<Utc>);

/// Timestamps arrive either as RFC 3339 strings or as epoch milliseconds.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTimestamp {
            Millis(i64),
            Text(String),
        }

        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {ms}"))),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
