use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{decode_server_event, ClientEmit, EventKind, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{backoff::Backoff, config::websocket_url, config::ClientSettings, error::ClientError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal: explicit disconnect, or reconnect attempts exhausted.
    Closed,
}

/// Sink for outbound stream events.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: ClientEmit) -> Result<(), ClientError>;
}

pub type SubscriptionId = u64;

/// Receiving end of a subscription to a set of inbound event names.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }
}

struct Subscriber {
    id: SubscriptionId,
    kinds: HashSet<EventKind>,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: SubscriptionId,
    subscribers: Vec<Subscriber>,
}

impl SubscriberRegistry {
    fn dispatch(&mut self, event: &ServerEvent) {
        let kind = event.kind();
        self.subscribers.retain(|subscriber| {
            !subscriber.kinds.contains(&kind) || subscriber.sender.send(event.clone()).is_ok()
        });
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    registry: Mutex<SubscriberRegistry>,
}

impl Shared {
    fn dispatch(&self, event: &ServerEvent) {
        lock(&self.registry).dispatch(event);
    }

    /// Moves to `next` unless the manager is already closed. Returns `false`
    /// when closed, so callers drop whatever they were about to publish.
    fn advance(&self, next: ConnectionState) -> bool {
        let mut open = true;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                open = false;
                return false;
            }
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        open
    }

    /// Hands a failed first attempt back to `Disconnected`.
    fn release(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Closed
    }
}

enum Command {
    Send(ClientEmit),
    Shutdown,
}

enum PumpExit {
    Shutdown,
    Dropped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the one event-stream connection of a session.
///
/// Shared as an `Arc` so UI surfaces can come and go without reconnecting.
pub struct ConnectionManager {
    settings: ClientSettings,
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl ConnectionManager {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            settings,
            shared: Arc::new(Shared {
                state,
                registry: Mutex::new(SubscriberRegistry::default()),
            }),
            commands: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Opens the stream and announces `join`. A no-op while a connection (or
    /// a reconnect loop) is already running; an error after `disconnect`,
    /// including a `disconnect` that lands while the stream is being opened.
    pub async fn connect(&self, user_id: &UserId) -> Result<()> {
        if !self.claim()? {
            return Ok(());
        }

        let opened = async {
            let url = websocket_url(&self.settings.server_url, user_id.as_str())?;
            let stream = open_stream(&url).await?;
            Ok::<_, anyhow::Error>((url, stream))
        }
        .await;
        let (url, mut stream) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.shared.release();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.install(tx, ConnectionState::Connected) {
            let _ = stream.close(None).await;
            debug!(user_id = %user_id, "stream: disconnected while connecting, dropping stream");
            return Err(ClientError::Closed.into());
        }
        info!(user_id = %user_id, "stream: connected");

        tokio::spawn(run_connection(
            Some(stream),
            rx,
            Arc::clone(&self.shared),
            url,
            user_id.clone(),
            self.backoff(),
        ));
        Ok(())
    }

    /// Starts the connection without waiting for the server. The first
    /// attempt and any retries run on the background task, so an unreachable
    /// server shows up as `Reconnecting` instead of an error.
    pub fn start(&self, user_id: &UserId) -> Result<()> {
        if !self.claim()? {
            return Ok(());
        }
        let url = match websocket_url(&self.settings.server_url, user_id.as_str()) {
            Ok(url) => url,
            Err(err) => {
                self.shared.release();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.install(tx, ConnectionState::Connecting) {
            return Err(ClientError::Closed.into());
        }
        info!(user_id = %user_id, "stream: starting");

        tokio::spawn(run_connection(
            None,
            rx,
            Arc::clone(&self.shared),
            url,
            user_id.clone(),
            self.backoff(),
        ));
        Ok(())
    }

    /// Terminal teardown. Emits queued before this call are still written.
    pub fn disconnect(&self) {
        let commands = {
            let mut commands = lock(&self.commands);
            self.shared.state.send_replace(ConnectionState::Closed);
            commands.take()
        };
        if let Some(commands) = commands {
            let _ = commands.send(Command::Shutdown);
        }
        info!("stream: disconnected");
    }

    /// Claims the slot by moving `Disconnected` to `Connecting`.
    fn claim(&self) -> Result<bool, ClientError> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if claimed {
            return Ok(true);
        }
        match self.state() {
            ConnectionState::Closed => Err(ClientError::Closed),
            state => {
                debug!(?state, "stream: connect ignored, already active");
                Ok(false)
            }
        }
    }

    /// Installs the command sender and publishes `state` in one step under the
    /// commands lock, which `disconnect` also holds while closing.
    fn install(&self, tx: mpsc::UnboundedSender<Command>, state: ConnectionState) -> bool {
        let mut commands = lock(&self.commands);
        if !self.shared.advance(state) {
            return false;
        }
        *commands = Some(tx);
        true
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            self.settings.reconnect_initial_backoff,
            self.settings.reconnect_max_backoff,
            self.settings.reconnect_max_attempts,
        )
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = lock(&self.shared.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(Subscriber {
            id,
            kinds: kinds.iter().copied().collect(),
            sender,
        });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.shared.registry)
            .subscribers
            .retain(|subscriber| subscriber.id != id);
    }
}

impl EventEmitter for ConnectionManager {
    fn emit(&self, event: ClientEmit) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(ClientError::Closed),
            _ => return Err(ClientError::NotConnected),
        }
        let commands = lock(&self.commands);
        let sender = commands.as_ref().ok_or(ClientError::NotConnected)?;
        sender
            .send(Command::Send(event))
            .map_err(|_| ClientError::Closed)
    }
}

async fn open_stream(url: &Url) -> Result<WsStream> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    Ok(stream)
}

async fn write_emit(stream: &mut WsStream, emit: &ClientEmit) -> Result<()> {
    let text = serde_json::to_string(emit)?;
    stream.send(Message::Text(text)).await?;
    Ok(())
}

/// Drives one manager's stream for its whole life. `first` is `None` when
/// the manager was started without waiting, in which case the first attempt
/// runs here immediately.
async fn run_connection(
    first: Option<WsStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    url: Url,
    user_id: UserId,
    mut backoff: Backoff,
) {
    let mut immediate = first.is_none();
    let mut next = first;
    loop {
        let mut stream = match next.take() {
            Some(stream) => stream,
            None => {
                let reopened =
                    reconnect(&url, &mut commands, &shared, &mut backoff, immediate).await;
                immediate = false;
                match reopened {
                    Some(stream) => stream,
                    None => break,
                }
            }
        };
        if shared.is_closed() {
            let _ = stream.close(None).await;
            break;
        }
        if let Err(err) = write_emit(&mut stream, &ClientEmit::Join(user_id.clone())).await {
            warn!(user_id = %user_id, "stream: failed to announce join: {err:#}");
            continue;
        }
        debug!(user_id = %user_id, "stream: join announced");

        if let PumpExit::Shutdown = pump(&mut stream, &mut commands, &shared).await {
            let _ = stream.close(None).await;
            break;
        }
    }
    shared.state.send_replace(ConnectionState::Closed);
}

async fn pump(
    stream: &mut WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Shared,
) -> PumpExit {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(emit)) => {
                    if let Err(err) = write_emit(stream, &emit).await {
                        warn!(event = emit.name(), "stream: send failed: {err:#}");
                        return PumpExit::Dropped;
                    }
                }
                Some(Command::Shutdown) | None => return PumpExit::Shutdown,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_server_event(&text) {
                    Ok(event) => shared.dispatch(&event),
                    Err(err) => warn!("stream: dropping malformed frame: {err}"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    warn!("stream: closed by server");
                    return PumpExit::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("stream: receive failed: {err}");
                    return PumpExit::Dropped;
                }
            },
        }
    }
}

/// Retries with backoff until a new stream is open, the attempt cap is hit,
/// or shutdown is requested. Emits issued meanwhile are dropped. With
/// `immediate` the first attempt skips the delay.
async fn reconnect(
    url: &Url,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Shared,
    backoff: &mut Backoff,
    mut immediate: bool,
) -> Option<WsStream> {
    loop {
        if immediate {
            immediate = false;
        } else {
            let Some(delay) = backoff.next_delay() else {
                warn!(
                    attempts = backoff.attempts(),
                    "stream: giving up after reconnect attempts"
                );
                return None;
            };
            let attempt = backoff.attempts();
            if !shared.advance(ConnectionState::Reconnecting { attempt }) {
                return None;
            }
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(attempt, delay_ms, "stream: reconnect scheduled");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(Command::Send(emit)) => {
                            debug!(event = emit.name(), "stream: dropping emit while disconnected");
                        }
                        Some(Command::Shutdown) | None => return None,
                    },
                }
            }
        }

        match open_stream(url).await {
            Ok(mut stream) => {
                if !shared.advance(ConnectionState::Connected) {
                    let _ = stream.close(None).await;
                    return None;
                }
                info!(attempts = backoff.attempts(), "stream: connected after retry");
                backoff.reset();
                return Some(stream);
            }
            Err(err) => warn!(attempt = backoff.attempts(), "stream: connect attempt failed: {err:#}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
