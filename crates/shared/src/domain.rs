use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Numeric ids on the wire are folded into their decimal string form so that
/// comparisons never depend on how the server happened to encode them.
fn deserialize_canonical_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    let value = match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text.trim().to_string(),
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    };
    if value.is_empty() {
        return Err(de::Error::custom("identifier must not be empty"));
    }
    Ok(value)
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_canonical_id(deserializer).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(TempId);

impl TempId {
    pub fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }
}

/// Local identity of a message: the server id once known, otherwise the
/// temporary id minted for the optimistic insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Temp(TempId),
}

impl MessageKey {
    pub fn server_id(&self) -> Option<&MessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Temp(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<&TempId> {
        match self {
            Self::Server(_) => None,
            Self::Temp(id) => Some(id),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Temp(id) => write!(f, "{id}"),
        }
    }
}

/// Ordered so that `max` is the forward-only merge of two observations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn advance(self, observed: DeliveryStatus) -> DeliveryStatus {
        self.max(observed)
    }
}

/// Unordered pair of participants identifying a 1:1 conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn includes(&self, sender: &UserId, recipient: &UserId) -> bool {
        (sender == &self.low && recipient == &self.high)
            || (sender == &self.high && recipient == &self.low)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub sender: UserId,
    pub recipient: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message arriving from the stream or a history fetch, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message: ChatMessage,
    /// Echo of the temporary id when this confirms one of our optimistic sends.
    pub temp_id: Option<TempId>,
    pub status: Option<DeliveryStatus>,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
