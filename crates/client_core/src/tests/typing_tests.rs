use super::*;

const IDLE: Duration = Duration::from_millis(1200);

fn coordinator_with_peer(peer: &str) -> TypingCoordinator {
    let mut coordinator = TypingCoordinator::new(UserId::new("me"), IDLE);
    assert_eq!(coordinator.switch_conversation(Some(UserId::new(peer))), None);
    coordinator
}

fn typing_flag(emit: &ClientEmit) -> (String, bool) {
    match emit {
        ClientEmit::Typing(payload) => (payload.to.to_string(), payload.is_typing),
        other => panic!("expected typing emit, got {other:?}"),
    }
}

#[test]
fn keystroke_burst_emits_exactly_two_edges() {
    let mut coordinator = coordinator_with_peer("bob");
    let start = Instant::now();
    let mut emitted = Vec::new();

    for step in 0..25u64 {
        let now = start + Duration::from_millis(step * 400);
        emitted.extend(coordinator.poll(now));
        emitted.extend(coordinator.input_changed(now));
    }
    let last_keystroke = start + Duration::from_millis(24 * 400);

    emitted.extend(coordinator.poll(last_keystroke + IDLE - Duration::from_millis(1)));
    assert_eq!(emitted.len(), 1);

    emitted.extend(coordinator.poll(last_keystroke + IDLE));
    emitted.extend(coordinator.poll(last_keystroke + IDLE * 3));

    let flags: Vec<_> = emitted.iter().map(typing_flag).collect();
    assert_eq!(
        flags,
        vec![("bob".to_string(), true), ("bob".to_string(), false)]
    );
}

#[test]
fn every_keystroke_rearms_the_deadline() {
    let mut coordinator = coordinator_with_peer("bob");
    let start = Instant::now();
    coordinator.input_changed(start);
    assert_eq!(coordinator.deadline(), Some(start + IDLE));

    let later = start + Duration::from_millis(700);
    coordinator.input_changed(later);
    assert_eq!(coordinator.deadline(), Some(later + IDLE));
    assert_eq!(coordinator.poll(start + IDLE), None);
}

#[test]
fn switching_conversation_flushes_stop_for_the_old_peer() {
    let mut coordinator = coordinator_with_peer("bob");
    coordinator.input_changed(Instant::now());

    let flushed = coordinator
        .switch_conversation(Some(UserId::new("carol")))
        .expect("typing:false for bob");
    assert_eq!(typing_flag(&flushed), ("bob".to_string(), false));
    assert!(!coordinator.is_local_typing());
    assert_eq!(coordinator.deadline(), None);
}

#[test]
fn input_without_open_conversation_is_ignored() {
    let mut coordinator = TypingCoordinator::new(UserId::new("me"), IDLE);
    assert_eq!(coordinator.input_changed(Instant::now()), None);
    assert!(!coordinator.is_local_typing());
}

#[test]
fn remote_typing_is_only_visible_for_the_open_peer() {
    let mut coordinator = coordinator_with_peer("bob");
    assert!(coordinator.apply_remote(&UserId::new("bob"), true));
    assert!(coordinator.apply_remote(&UserId::new("carol"), true));

    assert!(coordinator.is_peer_typing(&UserId::new("bob")));
    assert!(!coordinator.is_peer_typing(&UserId::new("carol")));

    coordinator.switch_conversation(Some(UserId::new("carol")));
    assert!(coordinator.is_peer_typing(&UserId::new("carol")));
    assert!(!coordinator.is_peer_typing(&UserId::new("bob")));

    assert!(coordinator.apply_remote(&UserId::new("carol"), false));
    assert!(!coordinator.is_peer_typing(&UserId::new("carol")));
}

#[test]
fn own_typing_echo_is_never_shown() {
    let mut coordinator = TypingCoordinator::new(UserId::new("me"), IDLE);
    coordinator.switch_conversation(Some(UserId::new("me")));
    assert!(!coordinator.apply_remote(&UserId::new("me"), true));
    assert!(!coordinator.is_peer_typing(&UserId::new("me")));
}
