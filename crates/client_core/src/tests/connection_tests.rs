use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{net::TcpListener, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct FakeServer {
    frames: mpsc::UnboundedSender<(usize, Value)>,
    connections: Arc<AtomicUsize>,
    /// Frames pushed to the client right after each `join`.
    on_join: Arc<Vec<String>>,
    drop_first_connection: bool,
    /// Holds the upgrade response back, keeping the client in `Connecting`.
    upgrade_delay: Duration,
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<FakeServer>) -> impl IntoResponse {
    if !server.upgrade_delay.is_zero() {
        tokio::time::sleep(server.upgrade_delay).await;
    }
    ws.on_upgrade(move |socket| serve_socket(socket, server))
}

async fn serve_socket(mut socket: WebSocket, server: FakeServer) {
    let index = server.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let is_join = frame["event"] == "join";
        let _ = server.frames.send((index, frame));
        if is_join {
            for pushed in server.on_join.iter() {
                if socket.send(WsMessage::Text(pushed.clone())).await.is_err() {
                    return;
                }
            }
            if index == 0 && server.drop_first_connection {
                return;
            }
        }
    }
}

type Frames = mpsc::UnboundedReceiver<(usize, Value)>;

fn serve(
    listener: TcpListener,
    on_join: Vec<String>,
    drop_first_connection: bool,
    upgrade_delay: Duration,
) -> (Frames, Arc<AtomicUsize>) {
    let (frames, frames_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let server = FakeServer {
        frames,
        connections: Arc::clone(&connections),
        on_join: Arc::new(on_join),
        drop_first_connection,
        upgrade_delay,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(server);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (frames_rx, connections)
}

async fn spawn_server(
    on_join: Vec<String>,
    drop_first_connection: bool,
) -> (String, Frames, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (frames, connections) = serve(listener, on_join, drop_first_connection, Duration::ZERO);
    (format!("http://{addr}"), frames, connections)
}

fn settings(server_url: String) -> ClientSettings {
    ClientSettings {
        server_url,
        reconnect_initial_backoff: Duration::from_millis(20),
        reconnect_max_backoff: Duration::from_millis(100),
        ..ClientSettings::default()
    }
}

async fn next_frame(frames: &mut Frames) -> (usize, Value) {
    timeout(WAIT, frames.recv())
        .await
        .expect("frame in time")
        .expect("server alive")
}

async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut states = manager.watch_state();
    timeout(WAIT, states.wait_for(|state| *state == wanted))
        .await
        .expect("state in time")
        .expect("state channel open");
}

#[tokio::test]
async fn connect_announces_join_and_forwards_roster() {
    let roster = json!({ "event": "online-users", "data": ["alice", "bob"] }).to_string();
    let (url, mut frames, _) = spawn_server(vec![roster], false).await;
    let manager = ConnectionManager::new(settings(url));
    let mut presence = manager.subscribe(&[EventKind::OnlineUsers]);

    manager.connect(&UserId::new("alice")).await.expect("connect");

    let (_, join) = next_frame(&mut frames).await;
    assert_eq!(join, json!({ "event": "join", "data": "alice" }));

    let event = timeout(WAIT, presence.recv()).await.expect("roster").expect("open");
    assert_eq!(
        event,
        ServerEvent::OnlineUsers(vec![UserId::new("alice"), UserId::new("bob")])
    );
}

#[tokio::test]
async fn second_connect_does_not_open_another_stream() {
    let (url, mut frames, connections) = spawn_server(Vec::new(), false).await;
    let manager = ConnectionManager::new(settings(url));
    let me = UserId::new("alice");

    manager.connect(&me).await.expect("first connect");
    manager.connect(&me).await.expect("second connect is a no-op");
    next_frame(&mut frames).await;

    manager
        .emit(ClientEmit::typing(&me, &UserId::new("bob"), true))
        .expect("emit");
    let (index, frame) = next_frame(&mut frames).await;
    assert_eq!(index, 0);
    assert_eq!(frame["event"], "typing");
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_stream_reconnects_and_re_announces_join() {
    let (url, mut frames, connections) = spawn_server(Vec::new(), true).await;
    let manager = ConnectionManager::new(settings(url));

    manager.connect(&UserId::new("alice")).await.expect("connect");

    let (first, join) = next_frame(&mut frames).await;
    assert_eq!((first, join["event"].clone()), (0, json!("join")));
    let (second, rejoin) = next_frame(&mut frames).await;
    assert_eq!(second, 1);
    assert_eq!(rejoin, json!({ "event": "join", "data": "alice" }));

    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_killing_the_stream() {
    let pushed = vec![
        "not json".to_string(),
        json!({ "event": "mystery", "data": 1 }).to_string(),
        json!({ "event": "typing", "data": ["bob", true] }).to_string(),
    ];
    let (url, _frames, _) = spawn_server(pushed, false).await;
    let manager = ConnectionManager::new(settings(url));
    let mut typing = manager.subscribe(&[EventKind::Typing]);

    manager.connect(&UserId::new("alice")).await.expect("connect");

    let event = timeout(WAIT, typing.recv()).await.expect("typing").expect("open");
    assert_eq!(
        event,
        ServerEvent::Typing {
            user_id: UserId::new("bob"),
            is_typing: true
        }
    );
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_flushes_queued_emits_and_is_terminal() {
    let (url, mut frames, _) = spawn_server(Vec::new(), false).await;
    let manager = ConnectionManager::new(settings(url));
    let me = UserId::new("alice");
    manager.connect(&me).await.expect("connect");
    next_frame(&mut frames).await;

    manager
        .emit(ClientEmit::typing(&me, &UserId::new("bob"), false))
        .expect("emit");
    manager.disconnect();

    let (_, frame) = next_frame(&mut frames).await;
    assert_eq!(frame["data"]["isTyping"], false);

    assert!(matches!(
        manager.emit(ClientEmit::Join(me.clone())),
        Err(ClientError::Closed)
    ));
    assert!(manager.connect(&me).await.is_err());
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn emit_before_connect_reports_not_connected() {
    let manager = ConnectionManager::new(ClientSettings::default());
    assert!(matches!(
        manager.emit(ClientEmit::Join(UserId::new("alice"))),
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn unsubscribed_receivers_get_nothing_more() {
    let roster = json!({ "event": "online-users", "data": ["alice"] }).to_string();
    let (url, mut frames, _) = spawn_server(vec![roster], false).await;
    let manager = ConnectionManager::new(settings(url));
    let kept = manager.subscribe(&[EventKind::OnlineUsers]);
    let removed = manager.subscribe(&[EventKind::OnlineUsers]);
    manager.unsubscribe(removed.id());

    let mut kept = kept;
    let mut removed = removed;
    manager.connect(&UserId::new("alice")).await.expect("connect");
    next_frame(&mut frames).await;

    timeout(WAIT, kept.recv()).await.expect("roster").expect("open");
    assert_eq!(removed.recv().await, None);
}

#[tokio::test]
async fn failed_first_connect_leaves_manager_reusable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let manager = ConnectionManager::new(settings(format!("http://{addr}")));
    assert!(manager.connect(&UserId::new("alice")).await.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_while_connecting_wins() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (mut frames, _) = serve(listener, Vec::new(), false, Duration::from_millis(300));
    let manager = ConnectionManager::new(settings(format!("http://{addr}")));

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect(&UserId::new("alice")).await })
    };
    wait_for_state(&manager, ConnectionState::Connecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.disconnect();

    let err = connecting.await.expect("connect task").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::Closed)
    ));
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(
        timeout(Duration::from_millis(300), frames.recv()).await.is_err(),
        "no join may be announced after disconnect"
    );
}

#[tokio::test]
async fn disconnect_during_retry_stays_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let manager = ConnectionManager::new(settings(format!("http://{addr}")));
    let mut states = manager.watch_state();

    manager.start(&UserId::new("alice")).expect("start");
    timeout(
        WAIT,
        states.wait_for(|state| matches!(state, ConnectionState::Reconnecting { .. })),
    )
    .await
    .expect("retrying in time")
    .expect("state channel open");
    manager.disconnect();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn start_keeps_retrying_until_the_server_appears() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let manager = ConnectionManager::new(settings(format!("http://{addr}")));
    let mut states = manager.watch_state();

    manager.start(&UserId::new("alice")).expect("start");
    timeout(
        WAIT,
        states.wait_for(|state| matches!(state, ConnectionState::Reconnecting { .. })),
    )
    .await
    .expect("retrying in time")
    .expect("state channel open");

    let listener = TcpListener::bind(addr).await.expect("rebind");
    let (mut frames, _) = serve(listener, Vec::new(), false, Duration::ZERO);

    let (_, join) = next_frame(&mut frames).await;
    assert_eq!(join, json!({ "event": "join", "data": "alice" }));
    wait_for_state(&manager, ConnectionState::Connected).await;
}

#[tokio::test]
async fn start_is_a_no_op_while_running_and_refused_after_disconnect() {
    let (url, mut frames, connections) = spawn_server(Vec::new(), false).await;
    let manager = ConnectionManager::new(settings(url));
    let me = UserId::new("alice");

    manager.start(&me).expect("start");
    manager.start(&me).expect("second start is a no-op");
    next_frame(&mut frames).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    manager.disconnect();
    assert!(manager.start(&me).is_err());
}
