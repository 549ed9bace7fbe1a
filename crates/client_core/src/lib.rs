//! Realtime core of a direct-messaging client: one event-stream connection,
//! presence, typing, the per-conversation message log and delivery receipts,
//! tied together by [`session::ChatSession`].

mod backoff;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod message_store;
pub mod presence;
pub mod rest;
pub mod session;
pub mod typing;

pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection::{ConnectionManager, ConnectionState, EventEmitter, Subscription};
pub use error::ClientError;
pub use rest::{HttpMessageApi, MessageApi, MissingMessageApi};
pub use session::{
    run_session, ChatSession, MessageView, PeerPresence, SessionCommand, SessionEvent,
};
