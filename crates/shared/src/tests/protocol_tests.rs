use super::*;
use serde_json::json;

#[test]
fn join_serializes_as_named_frame() {
    let frame = serde_json::to_value(ClientEmit::Join(UserId::new("u1"))).expect("serialize");
    assert_eq!(frame, json!({ "event": "join", "data": "u1" }));
}

#[test]
fn typing_emit_uses_camel_case_fields() {
    let emit = ClientEmit::typing(&UserId::new("me"), &UserId::new("peer"), true);
    let frame = serde_json::to_value(&emit).expect("serialize");
    assert_eq!(
        frame,
        json!({ "event": "typing", "data": { "from": "me", "to": "peer", "isTyping": true } })
    );
    assert_eq!(emit.name(), "typing");
}

#[test]
fn numeric_ids_are_canonicalized_to_strings() {
    let event = decode_server_event(r#"{"event":"online-users","data":[7,"8"]}"#).expect("decode");
    assert_eq!(
        event,
        ServerEvent::OnlineUsers(vec![UserId::new("7"), UserId::new("8")])
    );
}

#[test]
fn non_list_roster_decodes_as_malformed() {
    let event =
        decode_server_event(r#"{"event":"online-users","data":{"users":["a"]}}"#).expect("decode");
    assert_eq!(event, ServerEvent::RosterMalformed);
    assert_eq!(event.kind(), EventKind::OnlineUsers);
}

#[test]
fn unknown_event_is_rejected() {
    let err = decode_server_event(r#"{"event":"friend-request","data":{}}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownEvent(name) if name == "friend-request"));
}

#[test]
fn typing_payload_with_wrong_shape_is_rejected() {
    let err = decode_server_event(r#"{"event":"typing","data":{"user":"a"}}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::Payload { event: "typing", .. }));
}

#[test]
fn last_seen_accepts_epoch_millis_and_rfc3339() {
    let from_millis =
        decode_server_event(r#"{"event":"last-seen","data":["a",1700000000000]}"#).expect("millis");
    let from_text = decode_server_event(
        r#"{"event":"last-seen","data":["a","2023-11-14T22:13:20Z"]}"#,
    )
    .expect("rfc3339");
    assert_eq!(from_millis, from_text);
}

#[test]
fn receive_message_keeps_temp_id_echo() {
    let text = json!({
        "event": "receive-message",
        "data": {
            "_id": "m42",
            "tempId": "t1",
            "senderId": 1,
            "receiverId": "2",
            "content": "hello",
            "createdAt": "2024-01-01T00:00:00Z"
        }
    })
    .to_string();

    let ServerEvent::ReceiveMessage(incoming) = decode_server_event(&text).expect("decode") else {
        panic!("expected receive-message");
    };
    assert_eq!(incoming.message.key, MessageKey::Server(MessageId::new("m42")));
    assert_eq!(incoming.temp_id, Some(TempId::new("t1")));
    assert_eq!(incoming.message.sender, UserId::new("1"));
    assert_eq!(incoming.status, None);
}

#[test]
fn message_without_any_id_is_rejected() {
    let text = json!({
        "event": "receive-message",
        "data": {
            "senderId": "1",
            "receiverId": "2",
            "content": "hello",
            "createdAt": 1_700_000_000_000i64
        }
    })
    .to_string();
    assert!(matches!(
        decode_server_event(&text),
        Err(ProtocolError::Payload {
            event: "receive-message",
            ..
        })
    ));
}

#[test]
fn delivered_accepts_message_id_field() {
    let event = decode_server_event(r#"{"event":"delivered","data":{"messageId":"m1"}}"#)
        .expect("decode");
    assert_eq!(
        event,
        ServerEvent::Delivered {
            message_id: MessageId::new("m1")
        }
    );
}

#[test]
fn empty_identifier_is_rejected() {
    assert!(decode_server_event(r#"{"event":"read","data":{"from":"","to":"b"}}"#).is_err());
}
