//! Rooms, presence and topic broadcasts over the mock transport.

mod common;

use common::*;
use serde_json::json;
use std::collections::BTreeMap;
use tessel_sync_client::{ClientError, TopicMessage};
use tessel_sync_core::{PresenceOpts, PresenceView};
use tessel_sync_types::{
    ClientBroadcast, Frame, PeerId, RefreshPresence, RoomKey, RoomRef, ServerBroadcast, SetPresence,
};

fn refresh(room: &RoomKey, peers: &[(PeerId, serde_json::Value)]) -> Frame {
    Frame::RefreshPresence(RefreshPresence {
        room: room.clone(),
        data: peers.iter().cloned().collect::<BTreeMap<_, _>>(),
    })
}

// ============================================================================
// Presence
// ============================================================================

/// Repeated presence refreshes converge to one entry per peer, without this
/// client's own slice.
#[tokio::test]
async fn presence_converges_to_one_entry_per_peer() {
    let goals = Goals::new();
    let (client, mock) = connected(&goals, test_config("app")).await;
    let room = RoomKey::new("doc", "1");
    let me = client.peer_id();
    let other = PeerId::new();

    let membership = client.join_room(room.clone(), Some(json!({"name": "me"})));
    let views = Recorder::<PresenceView>::new();
    let _watch = client.subscribe_presence(&room, PresenceOpts::default(), views.callback());
    assert!(views.last().unwrap().is_loading);
    eventually("join-room", || count_ops(&mock, "join-room") == 1).await;

    mock.queue_frame(&Frame::JoinRoomOk(RoomRef { room: room.clone() }));
    mock.queue_frame(&refresh(
        &room,
        &[(me, json!({"name": "me"})), (other, json!({"name": "o", "cursor": 1}))],
    ));
    mock.queue_frame(&refresh(
        &room,
        &[(other, json!({"name": "o", "cursor": 2})), (me, json!({"name": "me"}))],
    ));
    eventually("second refresh", || {
        views
            .last()
            .is_some_and(|v| v.peers.get(&other) == Some(&json!({"name": "o", "cursor": 2})))
    })
    .await;

    let view = views.last().unwrap();
    assert!(!view.is_loading);
    assert_eq!(view.peers.len(), 1);
    assert!(!view.peers.contains_key(&me));
    assert_eq!(view.user, Some(json!({"name": "me"})));

    membership.publish_presence(json!({"cursor": 5})).unwrap();
    eventually("set-presence", || count_ops(&mock, "set-presence") == 1).await;
    let sent = mock.sent_frames().into_iter().find_map(|f| match f {
        Frame::SetPresence(SetPresence { data, .. }) => Some(data),
        _ => None,
    });
    assert_eq!(sent, Some(json!({"name": "me", "cursor": 5})));

    client.shutdown().await;
}

/// Joins are refcounted: one `join-room` for two memberships, one
/// `leave-room` once both are gone.
#[tokio::test]
async fn room_membership_is_refcounted() {
    let goals = Goals::new();
    let (client, mock) = connected(&goals, test_config("app")).await;
    let room = RoomKey::new("doc", "2");

    let first = client.join_room(room.clone(), None);
    let second = client.join_room(room.clone(), None);
    eventually("join-room", || count_ops(&mock, "join-room") == 1).await;

    first.leave();
    first.leave();
    assert_eq!(count_ops(&mock, "leave-room"), 0);
    drop(second);
    eventually("leave-room", || count_ops(&mock, "leave-room") == 1).await;
    assert_eq!(count_ops(&mock, "join-room"), 1);

    assert!(matches!(
        client.publish_presence(&room, json!({"x": 1})),
        Err(ClientError::RoomNotJoined(_))
    ));

    client.shutdown().await;
}

/// Rooms are joined again after a reconnect.
#[tokio::test]
async fn rooms_rejoin_after_reconnect() {
    let goals = Goals::new();
    let (client, mock) = connected(&goals, test_config("app")).await;
    let room = RoomKey::new("doc", "3");
    let _membership = client.join_room(room.clone(), Some(json!({"name": "me"})));
    eventually("join-room", || count_ops(&mock, "join-room") == 1).await;

    mock.drop_connection();
    eventually("rejoin", || count_ops(&mock, "join-room") == 2).await;
    let rejoined = mock
        .sent_frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::JoinRoom(join) => Some(join),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(rejoined.room, room);
    assert_eq!(rejoined.peer_id, client.peer_id());
    assert_eq!(rejoined.data, json!({"name": "me"}));

    client.shutdown().await;
}

// ============================================================================
// Topics
// ============================================================================

/// Topic messages reach handlers of the topic, never echo the sender, and
/// publishing needs a joined room.
#[tokio::test]
async fn topic_messages_skip_self() {
    let goals = Goals::new();
    let (client, mock) = connected(&goals, test_config("app")).await;
    let room = RoomKey::new("chat", "lobby");
    let other = PeerId::new();

    assert!(matches!(
        client.publish_topic(&room, "emoji", json!("wave")),
        Err(ClientError::RoomNotJoined(_))
    ));

    let _membership = client.join_room(room.clone(), None);
    let emoji = Recorder::<TopicMessage>::new();
    let _topic = client.subscribe_topic(&room, "emoji", emoji.callback());
    mock.queue_frame(&Frame::JoinRoomOk(RoomRef { room: room.clone() }));

    let broadcast = |peer_id: PeerId, topic: &str, data: serde_json::Value| {
        Frame::ServerBroadcast(ServerBroadcast {
            room: room.clone(),
            topic: topic.into(),
            peer_id,
            data,
        })
    };
    mock.queue_frame(&broadcast(client.peer_id(), "emoji", json!("echo")));
    mock.queue_frame(&broadcast(other, "cursor", json!({"x": 1})));
    mock.queue_frame(&broadcast(other, "emoji", json!("wave")));

    eventually("topic message", || emoji.len() == 1).await;
    let message = emoji.last().unwrap();
    assert_eq!(message.peer_id, other);
    assert_eq!(message.data, json!("wave"));

    client.publish_topic(&room, "emoji", json!("hi")).unwrap();
    eventually("client-broadcast", || count_ops(&mock, "client-broadcast") == 1).await;
    let sent = mock.sent_frames().into_iter().find_map(|f| match f {
        Frame::ClientBroadcast(ClientBroadcast { topic, data, .. }) => Some((topic, data)),
        _ => None,
    });
    assert_eq!(sent, Some(("emoji".to_string(), json!("hi"))));
    assert_eq!(emoji.len(), 1);

    client.shutdown().await;
}
