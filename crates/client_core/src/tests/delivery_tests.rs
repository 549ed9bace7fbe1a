use super::*;
use chrono::TimeZone;
use shared::domain::TempId;

fn me() -> UserId {
    UserId::new("me")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn message(id: &str, from: UserId, to: UserId, secs: i64) -> ChatMessage {
    ChatMessage {
        key: MessageKey::Server(MessageId::new(id)),
        sender: from,
        recipient: to,
        content: format!("text {id}"),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

#[test]
fn final_status_is_the_maximum_regardless_of_order() {
    use DeliveryStatus::{Delivered, Read, Sent};
    let orders = [
        [Sent, Delivered, Read],
        [Read, Delivered, Sent],
        [Delivered, Read, Sent],
        [Sent, Read, Delivered],
    ];
    for order in orders {
        let mut tracker = DeliveryTracker::new(me());
        let key = MessageKey::Server(MessageId::new("m1"));
        for status in order {
            tracker.observe(&key, status);
        }
        assert_eq!(tracker.status(&key), Read, "order {order:?}");
    }
}

#[test]
fn delivered_after_read_is_a_no_op() {
    let mut tracker = DeliveryTracker::new(me());
    let id = MessageId::new("m1");
    let key = MessageKey::Server(id.clone());
    assert!(tracker.observe(&key, DeliveryStatus::Read));
    assert!(!tracker.mark_delivered(&id));
    assert_eq!(tracker.status(&key), DeliveryStatus::Read);
}

#[test]
fn receipt_for_unknown_message_applies_once_it_arrives() {
    let mut tracker = DeliveryTracker::new(me());
    tracker.mark_delivered(&MessageId::new("m7"));

    let arrived = message("m7", me(), bob(), 0);
    assert_eq!(tracker.status(&arrived.key), DeliveryStatus::Delivered);
}

#[test]
fn read_receipt_marks_the_whole_direction() {
    let mut tracker = DeliveryTracker::new(me());
    let messages = vec![
        message("m1", me(), bob(), 0),
        message("m2", bob(), me(), 1),
        message("m3", me(), bob(), 2),
    ];
    tracker.mark_delivered(&MessageId::new("m3"));

    assert_eq!(tracker.mark_read_direction(&me(), &bob(), &messages), 2);
    assert_eq!(tracker.status(&messages[0].key), DeliveryStatus::Read);
    assert_eq!(tracker.status(&messages[1].key), DeliveryStatus::Sent);
    assert_eq!(tracker.status(&messages[2].key), DeliveryStatus::Read);
}

#[test]
fn older_message_arriving_after_read_receipt_is_read() {
    let mut tracker = DeliveryTracker::new(me());
    tracker.mark_read_direction(&me(), &bob(), &[message("m5", me(), bob(), 50)]);

    let older = message("m4", me(), bob(), 40);
    let newer = message("m6", me(), bob(), 60);
    assert!(tracker.track(&older));
    assert!(!tracker.track(&newer));
    assert_eq!(tracker.status(&older.key), DeliveryStatus::Read);
    assert_eq!(tracker.status(&newer.key), DeliveryStatus::Sent);
}

#[test]
fn rekey_carries_status_to_the_server_id() {
    let mut tracker = DeliveryTracker::new(me());
    let temp = MessageKey::Temp(TempId::new("t1"));
    let server = MessageKey::Server(MessageId::new("m42"));
    tracker.observe(&temp, DeliveryStatus::Delivered);

    tracker.rekey(&temp, &server);
    assert_eq!(tracker.status(&server), DeliveryStatus::Delivered);
    assert_eq!(tracker.status(&temp), DeliveryStatus::Sent);
}

#[test]
fn read_receipt_is_emitted_at_most_once_per_unread_set() {
    let mut tracker = DeliveryTracker::new(me());
    let mut messages = vec![message("m1", bob(), me(), 0), message("m2", me(), bob(), 1)];

    let emit = tracker.read_receipt_due(&bob(), &messages).expect("unread from bob");
    assert_eq!(emit, ClientEmit::read_messages(&bob(), &me()));
    assert_eq!(tracker.read_receipt_due(&bob(), &messages), None);

    messages.push(message("m3", bob(), me(), 2));
    assert!(tracker.read_receipt_due(&bob(), &messages).is_some());
    assert_eq!(tracker.read_receipt_due(&bob(), &messages), None);
}

#[test]
fn own_unread_messages_do_not_trigger_a_receipt() {
    let mut tracker = DeliveryTracker::new(me());
    let messages = vec![message("m1", me(), bob(), 0)];
    assert_eq!(tracker.read_receipt_due(&bob(), &messages), None);
}
