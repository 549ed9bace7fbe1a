use std::{sync::Arc, time::Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatMessage, DeliveryStatus, IncomingMessage, MessageKey, TempId, UserId},
    error::ErrorCode,
    protocol::{
        ClientEmit, EventKind, MessagePayload, PersistMessageRequest, SendMessagePayload,
        ServerEvent,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    connection::{ConnectionManager, ConnectionState, EventEmitter},
    delivery::DeliveryTracker,
    error::ClientError,
    message_store::{MessageStore, Reconciled},
    presence::{Presence, PresenceTracker},
    rest::MessageApi,
    typing::TypingCoordinator,
};

/// A history fetch issued for one conversation selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub peer: UserId,
    generation: u64,
    /// Roster membership when the fetch was issued; decides implicit delivery.
    peer_online: bool,
}

/// Which UI-facing views an input touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    pub messages: bool,
    pub presence: bool,
    pub typing: bool,
}

impl Changes {
    pub const ALL: Changes = Changes {
        messages: true,
        presence: true,
        typing: true,
    };

    fn messages(changed: bool) -> Self {
        Self {
            messages: changed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub message: ChatMessage,
    pub status: DeliveryStatus,
    pub outgoing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPresence {
    pub peer: UserId,
    pub presence: Presence,
    pub last_seen: Option<DateTime<Utc>>,
    /// The stream is down; `presence` reflects the last roster seen.
    pub stale: bool,
}

/// Composition root for one signed-in user and at most one open conversation.
///
/// Every input is applied synchronously, one at a time; the async driver in
/// [`run_session`] only feeds it.
pub struct ChatSession {
    local_user: UserId,
    emitter: Arc<dyn EventEmitter>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    store: MessageStore,
    delivery: DeliveryTracker,
    focused: bool,
    generation: u64,
}

impl ChatSession {
    pub fn new(
        local_user: UserId,
        emitter: Arc<dyn EventEmitter>,
        settings: &ClientSettings,
    ) -> Self {
        Self {
            presence: PresenceTracker::new(),
            typing: TypingCoordinator::new(local_user.clone(), settings.typing_idle),
            store: MessageStore::new(local_user.clone(), settings.dedup_window),
            delivery: DeliveryTracker::new(local_user.clone()),
            local_user,
            emitter,
            focused: true,
            generation: 0,
        }
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.store.peer()
    }

    /// Opens `peer` (or closes the current conversation with `None`).
    ///
    /// A pending `typing:false` for the conversation being left is emitted
    /// before anything else happens. Returns the history fetch to run for the
    /// new conversation.
    pub fn select_peer(&mut self, peer: Option<UserId>) -> Option<HistoryRequest> {
        if self.store.peer() == peer.as_ref() {
            return None;
        }
        if let Some(flushed) = self.typing.switch_conversation(peer.clone()) {
            self.emit(flushed);
        }
        if let Some(previous) = self.store.close() {
            debug!(peer = %previous, "session: conversation closed");
        }
        self.delivery.reset();
        self.generation += 1;

        let peer = peer?;
        info!(peer = %peer, "session: conversation opened");
        self.store.open(peer.clone());
        Some(self.history_request(peer))
    }

    /// Issues a fresh fetch for the open conversation after a failed one.
    /// Fetches still in flight become stale.
    pub fn retry_history(&mut self) -> Result<HistoryRequest, ClientError> {
        let peer = self
            .store
            .peer()
            .cloned()
            .ok_or(ClientError::NoConversation)?;
        if self.store.is_history_loaded() {
            return Err(ClientError::HistoryLoaded);
        }
        self.generation += 1;
        info!(peer = %peer, "session: retrying history fetch");
        Ok(self.history_request(peer))
    }

    fn history_request(&self, peer: UserId) -> HistoryRequest {
        HistoryRequest {
            peer_online: self.presence.is_online(&peer),
            peer,
            generation: self.generation,
        }
    }

    /// Whether `request` still belongs to the open conversation.
    pub fn is_current(&self, request: &HistoryRequest) -> bool {
        request.generation == self.generation && self.store.peer() == Some(&request.peer)
    }

    pub fn apply_history(
        &mut self,
        request: &HistoryRequest,
        payloads: Vec<MessagePayload>,
    ) -> Changes {
        if !self.is_current(request) {
            debug!(peer = %request.peer, "session: discarding history for a stale conversation");
            return Changes::default();
        }
        let batch: Vec<IncomingMessage> = payloads
            .into_iter()
            .filter_map(|payload| match IncomingMessage::try_from(payload) {
                Ok(incoming) => Some(incoming),
                Err(err) => {
                    warn!(peer = %request.peer, "session: dropping malformed history item: {err}");
                    None
                }
            })
            .collect();
        let Some(outcomes) = self.store.load_history(&request.peer, &batch) else {
            return Changes::default();
        };
        for (key, outcome) in &outcomes {
            self.follow_merge(key, outcome);
        }

        for (key, status) in self
            .store
            .append_delivered_set_from_history(&batch, request.peer_online)
        {
            self.delivery.observe(&key, status);
        }
        for message in self.store.messages() {
            self.delivery.track(message);
        }
        info!(
            peer = %request.peer,
            fetched = batch.len(),
            listed = self.store.messages().len(),
            "session: history loaded"
        );
        self.check_read_receipt();
        Changes::messages(true)
    }

    pub fn input_changed(&mut self, now: Instant) {
        if let Some(emit) = self.typing.input_changed(now) {
            self.emit(emit);
        }
    }

    pub fn poll_typing(&mut self, now: Instant) {
        if let Some(emit) = self.typing.poll(now) {
            self.emit(emit);
        }
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    /// Inserts the optimistic entry and emits `send-message`. The returned
    /// request is the durable-storage submission to run alongside it.
    pub fn send_text(
        &mut self,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<PersistMessageRequest, ClientError> {
        let temp_id = TempId::generate();
        let message = self.store.append_optimistic(temp_id.clone(), text, now)?;
        if let Some(flushed) = self.typing.flush() {
            self.emit(flushed);
        }
        debug!(peer = %message.recipient, temp_id = %temp_id, "session: message sent");
        Ok(self.submit(message, temp_id))
    }

    /// Submits an unsaved entry again under its original temp id, so the
    /// echo still lands on the same entry.
    pub fn resend(&self, temp_id: &TempId) -> Result<PersistMessageRequest, ClientError> {
        let message = self
            .store
            .pending(temp_id)
            .cloned()
            .ok_or_else(|| ClientError::NotPending(temp_id.clone()))?;
        info!(peer = %message.recipient, temp_id = %temp_id, "session: resending message");
        Ok(self.submit(message, temp_id.clone()))
    }

    fn submit(&self, message: ChatMessage, temp_id: TempId) -> PersistMessageRequest {
        self.emit(ClientEmit::SendMessage(SendMessagePayload {
            from: message.sender.clone(),
            to: message.recipient.clone(),
            content: message.content.clone(),
            temp_id: temp_id.clone(),
        }));
        PersistMessageRequest {
            sender_id: message.sender,
            receiver_id: message.recipient,
            content: message.content,
            temp_id,
        }
    }

    pub fn handle_event(&mut self, event: ServerEvent) -> Changes {
        if self.presence.apply(&event) {
            return Changes {
                presence: true,
                ..Changes::default()
            };
        }
        match event {
            ServerEvent::Typing { user_id, is_typing } => Changes {
                typing: self.typing.apply_remote(&user_id, is_typing),
                ..Changes::default()
            },
            ServerEvent::ReceiveMessage(incoming) => self.receive(incoming),
            ServerEvent::Delivered { message_id } => {
                Changes::messages(self.delivery.mark_delivered(&message_id))
            }
            ServerEvent::Read { from, to } => {
                let advanced = self
                    .delivery
                    .mark_read_direction(&from, &to, self.store.messages());
                Changes::messages(advanced > 0)
            }
            ServerEvent::OnlineUsers(_)
            | ServerEvent::RosterMalformed
            | ServerEvent::LastSeen { .. } => Changes::default(),
        }
    }

    pub fn set_focused(&mut self, focused: bool) -> Changes {
        if self.focused == focused {
            return Changes::default();
        }
        self.focused = focused;
        if focused {
            self.check_read_receipt();
        }
        Changes::messages(focused)
    }

    pub fn on_connection_state(&mut self, state: &ConnectionState) -> Changes {
        let stale = *state != ConnectionState::Connected;
        if self.presence.is_stale() == stale {
            return Changes::default();
        }
        self.presence.set_stale(stale);
        Changes {
            presence: true,
            ..Changes::default()
        }
    }

    /// Empties the open conversation after the service deleted it.
    pub fn clear_conversation(&mut self) -> Changes {
        if self.store.peer().is_none() {
            return Changes::default();
        }
        self.store.clear();
        self.delivery.reset();
        Changes::messages(true)
    }

    /// Closes the conversation if it is with `peer`.
    pub fn close_if_peer(&mut self, peer: &UserId) -> bool {
        if self.store.peer() != Some(peer) {
            return false;
        }
        self.select_peer(None);
        true
    }

    /// Flushes typing and drops the conversation. The caller tears the
    /// connection down afterwards.
    pub fn logout(&mut self) {
        self.select_peer(None);
        info!(user_id = %self.local_user, "session: logged out");
    }

    pub fn messages(&self) -> Vec<MessageView> {
        self.store
            .messages()
            .iter()
            .map(|message| MessageView {
                status: self.delivery.status(&message.key),
                outgoing: message.sender == self.local_user,
                message: message.clone(),
            })
            .collect()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.typing
            .open_peer()
            .is_some_and(|peer| self.typing.is_peer_typing(peer))
    }

    pub fn peer_presence(&self) -> Option<PeerPresence> {
        let peer = self.store.peer()?;
        Some(PeerPresence {
            peer: peer.clone(),
            presence: self.presence.presence(peer),
            last_seen: self.presence.last_seen(peer),
            stale: self.presence.is_stale(),
        })
    }

    fn receive(&mut self, incoming: IncomingMessage) -> Changes {
        let key = incoming.message.key.clone();
        let outcome = self.store.reconcile(&incoming);
        let current = match &outcome {
            Reconciled::OutOfScope => {
                debug!(key = %key, "session: message outside the open conversation");
                return Changes::default();
            }
            Reconciled::Duplicate { of } => of.clone(),
            Reconciled::Replaced { .. } | Reconciled::Appended { .. } => key.clone(),
        };
        self.follow_merge(&key, &outcome);
        if let Some(status) = incoming.status {
            self.delivery.observe(&current, status);
        }
        if let Some(message) = self
            .store
            .messages()
            .iter()
            .find(|message| message.key == current)
        {
            self.delivery.track(message);
        }
        self.check_read_receipt();
        Changes::messages(true)
    }

    /// Moves delivery status off keys that a merge made disappear.
    fn follow_merge(&mut self, key: &MessageKey, outcome: &Reconciled) {
        match outcome {
            Reconciled::Replaced { index, superseded } => {
                let Some(current) = self.store.messages().get(*index) else {
                    return;
                };
                let current = current.key.clone();
                for old in superseded {
                    self.delivery.rekey(old, &current);
                }
            }
            Reconciled::Duplicate { of } => self.delivery.rekey(key, of),
            Reconciled::OutOfScope | Reconciled::Appended { .. } => {}
        }
    }

    fn check_read_receipt(&mut self) {
        if !self.focused {
            return;
        }
        let Some(peer) = self.store.peer() else {
            return;
        };
        if let Some(receipt) = self.delivery.read_receipt_due(peer, self.store.messages()) {
            self.emit(receipt);
        }
    }

    fn emit(&self, event: ClientEmit) {
        let name = event.name();
        if let Err(err) = self.emitter.emit(event) {
            warn!(event = name, "session: emit failed: {err}");
        }
    }
}

/// Input from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Open a conversation, or close the current one with `None`.
    SelectPeer(Option<UserId>),
    InputChanged,
    Send(String),
    SetFocused(bool),
    /// Fetch the open conversation again after a failed load.
    RetryHistory,
    /// Submit an unsaved message again.
    Resend(TempId),
    DeleteConversation,
    BlockPeer,
    Logout,
}

/// Output to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessagesChanged(Vec<MessageView>),
    PresenceChanged(Option<PeerPresence>),
    PeerTyping(bool),
    ConnectionChanged(ConnectionState),
    /// The open conversation could not be loaded. `retryable` failures can
    /// be retried with [`SessionCommand::RetryHistory`].
    HistoryFailed {
        peer: UserId,
        retryable: bool,
        reason: String,
    },
    /// A message was not saved. `retryable` failures can be resubmitted with
    /// [`SessionCommand::Resend`].
    SendFailed {
        temp_id: TempId,
        retryable: bool,
        reason: String,
    },
    /// Non-blocking error for the user; the session keeps running.
    Notice(String),
}

enum Completion {
    History {
        request: HistoryRequest,
        result: Result<Vec<MessagePayload>>,
    },
    Persisted {
        peer: UserId,
        temp_id: TempId,
        result: Result<()>,
    },
    Deleted {
        peer: UserId,
        result: Result<()>,
    },
    Blocked {
        peer: UserId,
        result: Result<()>,
    },
}

/// Connects as `local_user` and drives a [`ChatSession`] until logout or
/// until `commands` closes.
///
/// An unreachable server is not an error: the connection keeps retrying in
/// the background and the session reports `Reconnecting` meanwhile.
pub async fn run_session(
    connection: Arc<ConnectionManager>,
    api: Arc<dyn MessageApi>,
    local_user: UserId,
    settings: ClientSettings,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
) -> Result<()> {
    let emitter: Arc<dyn EventEmitter> = connection.clone();
    let mut session = ChatSession::new(local_user.clone(), emitter, &settings);
    let mut inbound = connection.subscribe(&EventKind::ALL);
    let mut states = connection.watch_state();
    connection.start(&local_user)?;

    let (completions_tx, mut completions) = mpsc::unbounded_channel();
    let mut fetch: Option<JoinHandle<()>> = None;

    loop {
        let deadline = session.next_typing_deadline();
        let typing_idle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            Some(event) = inbound.recv() => {
                let changes = session.handle_event(event);
                publish(&session, &events, changes);
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("session: command channel closed");
                    shutdown(&mut session, &connection, fetch.take());
                    break;
                };
                if command == SessionCommand::Logout {
                    shutdown(&mut session, &connection, fetch.take());
                    break;
                }
                handle_command(
                    &mut session,
                    &api,
                    &completions_tx,
                    &mut fetch,
                    &events,
                    command,
                );
            }
            Some(completion) = completions.recv() => {
                handle_completion(&mut session, &events, completion);
            }
            Ok(()) = states.changed() => {
                let state = states.borrow_and_update().clone();
                let changes = session.on_connection_state(&state);
                let _ = events.send(SessionEvent::ConnectionChanged(state.clone()));
                match state {
                    ConnectionState::Reconnecting { attempt: 1 } => {
                        notice(&events, "message server is unreachable, reconnecting");
                    }
                    ConnectionState::Closed => {
                        notice(&events, "connection to the message server was lost");
                    }
                    _ => {}
                }
                publish(&session, &events, changes);
            }
            () = typing_idle => session.poll_typing(Instant::now()),
        }
    }

    connection.unsubscribe(inbound.id());
    let _ = events.send(SessionEvent::ConnectionChanged(ConnectionState::Closed));
    Ok(())
}

fn handle_command(
    session: &mut ChatSession,
    api: &Arc<dyn MessageApi>,
    completions: &mpsc::UnboundedSender<Completion>,
    fetch: &mut Option<JoinHandle<()>>,
    events: &broadcast::Sender<SessionEvent>,
    command: SessionCommand,
) {
    match command {
        SessionCommand::SelectPeer(peer) => {
            if session.peer() == peer.as_ref() {
                return;
            }
            if let Some(previous) = fetch.take() {
                previous.abort();
            }
            if let Some(request) = session.select_peer(peer) {
                *fetch = Some(spawn_fetch(api, completions, request));
            }
            publish(session, events, Changes::ALL);
        }
        SessionCommand::RetryHistory => match session.retry_history() {
            Ok(request) => {
                if let Some(previous) = fetch.take() {
                    previous.abort();
                }
                *fetch = Some(spawn_fetch(api, completions, request));
            }
            Err(err) => notice(events, err.to_string()),
        },
        SessionCommand::InputChanged => session.input_changed(Instant::now()),
        SessionCommand::Send(text) => match session.send_text(&text, Utc::now()) {
            Ok(request) => {
                publish(session, events, Changes::messages(true));
                spawn_persist(api, completions, request);
            }
            Err(err) => notice(events, err.to_string()),
        },
        SessionCommand::Resend(temp_id) => match session.resend(&temp_id) {
            Ok(request) => spawn_persist(api, completions, request),
            Err(err) => notice(events, err.to_string()),
        },
        SessionCommand::SetFocused(focused) => {
            let changes = session.set_focused(focused);
            publish(session, events, changes);
        }
        SessionCommand::DeleteConversation => {
            let Some(peer) = session.peer().cloned() else {
                notice(events, ClientError::NoConversation.to_string());
                return;
            };
            let api = Arc::clone(api);
            let completions = completions.clone();
            tokio::spawn(async move {
                let result = api.delete_conversation(&peer).await;
                let _ = completions.send(Completion::Deleted { peer, result });
            });
        }
        SessionCommand::BlockPeer => {
            let Some(peer) = session.peer().cloned() else {
                notice(events, ClientError::NoConversation.to_string());
                return;
            };
            let api = Arc::clone(api);
            let completions = completions.clone();
            tokio::spawn(async move {
                let result = api.block_user(&peer).await;
                let _ = completions.send(Completion::Blocked { peer, result });
            });
        }
        SessionCommand::Logout => {}
    }
}

fn handle_completion(
    session: &mut ChatSession,
    events: &broadcast::Sender<SessionEvent>,
    completion: Completion,
) {
    match completion {
        Completion::History { request, result } => match result {
            Ok(payloads) => {
                let changes = session.apply_history(&request, payloads);
                publish(session, events, changes);
            }
            Err(err) if session.is_current(&request) => {
                warn!(peer = %request.peer, "session: history fetch failed: {err:#}");
                let _ = events.send(SessionEvent::HistoryFailed {
                    retryable: is_retryable(&err),
                    reason: format!("{err:#}"),
                    peer: request.peer,
                });
            }
            Err(err) => debug!(peer = %request.peer, "session: stale history fetch failed: {err:#}"),
        },
        Completion::Persisted {
            peer,
            temp_id,
            result,
        } => match result {
            Ok(()) => debug!(temp_id = %temp_id, "session: message persisted"),
            Err(err) => {
                warn!(temp_id = %temp_id, "session: persisting message failed: {err:#}");
                let reason = match api_code(&err) {
                    Some(ErrorCode::Blocked) => format!("{peer} is not accepting messages from you"),
                    _ => format!("{err:#}"),
                };
                let _ = events.send(SessionEvent::SendFailed {
                    retryable: is_retryable(&err),
                    reason,
                    temp_id,
                });
            }
        },
        Completion::Deleted { peer, result } => match result {
            Ok(()) => {
                info!(peer = %peer, "session: conversation deleted");
                if session.peer() == Some(&peer) {
                    let changes = session.clear_conversation();
                    publish(session, events, changes);
                }
            }
            Err(err) => {
                warn!(peer = %peer, "session: delete failed: {err:#}");
                notice(events, format!("could not delete the conversation: {err:#}"));
            }
        },
        Completion::Blocked { peer, result } => match result {
            Ok(()) => {
                info!(peer = %peer, "session: user blocked");
                if session.close_if_peer(&peer) {
                    publish(session, events, Changes::ALL);
                }
                notice(events, format!("{peer} was blocked"));
            }
            Err(err) => {
                warn!(peer = %peer, "session: block failed: {err:#}");
                notice(events, format!("could not block {peer}: {err:#}"));
            }
        },
    }
}

fn spawn_fetch(
    api: &Arc<dyn MessageApi>,
    completions: &mpsc::UnboundedSender<Completion>,
    request: HistoryRequest,
) -> JoinHandle<()> {
    let api = Arc::clone(api);
    let completions = completions.clone();
    tokio::spawn(async move {
        let result = api.fetch_history(&request.peer).await;
        let _ = completions.send(Completion::History { request, result });
    })
}

fn spawn_persist(
    api: &Arc<dyn MessageApi>,
    completions: &mpsc::UnboundedSender<Completion>,
    request: PersistMessageRequest,
) {
    let api = Arc::clone(api);
    let completions = completions.clone();
    tokio::spawn(async move {
        let peer = request.receiver_id.clone();
        let temp_id = request.temp_id.clone();
        let result = api.persist_message(request).await;
        let _ = completions.send(Completion::Persisted {
            peer,
            temp_id,
            result,
        });
    });
}

fn api_code(err: &anyhow::Error) -> Option<ErrorCode> {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Api(exception)) => Some(exception.code),
        _ => None,
    }
}

/// Transport failures never reached the service and are worth retrying;
/// service rejections only when the service says so.
fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Api(exception)) => exception.is_transient(),
        _ => true,
    }
}

/// Typing is flushed while the stream is still up; disconnect then writes it
/// before closing.
fn shutdown(
    session: &mut ChatSession,
    connection: &ConnectionManager,
    fetch: Option<JoinHandle<()>>,
) {
    if let Some(fetch) = fetch {
        fetch.abort();
    }
    session.logout();
    connection.disconnect();
}

fn publish(session: &ChatSession, events: &broadcast::Sender<SessionEvent>, changes: Changes) {
    if changes.messages {
        let _ = events.send(SessionEvent::MessagesChanged(session.messages()));
    }
    if changes.presence {
        let _ = events.send(SessionEvent::PresenceChanged(session.peer_presence()));
    }
    if changes.typing {
        let _ = events.send(SessionEvent::PeerTyping(session.is_peer_typing()));
    }
}

fn notice(events: &broadcast::Sender<SessionEvent>, text: impl Into<String>) {
    let _ = events.send(SessionEvent::Notice(text.into()));
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
