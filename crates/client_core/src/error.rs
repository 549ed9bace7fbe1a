use shared::{
    domain::TempId,
    error::{ApiException, ProtocolError},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("event stream is not connected")]
    NotConnected,
    #[error("event stream was closed")]
    Closed,
    #[error("no conversation is open")]
    NoConversation,
    #[error("invalid server url `{0}`: expected http:// or https://")]
    InvalidServerUrl(String),
    #[error("conversation history is already loaded")]
    HistoryLoaded,
    #[error("no unsaved message `{0}` in the open conversation")]
    NotPending(TempId),
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("message service rejected the request: {0}")]
    Api(#[from] ApiException),
}
