//! End-to-end exercises against a live node on the loopback interface.
//!
//! A raw UDP socket plays the remote peer, so every exchange is unicast and
//! deterministic: the node learns the forged peer's address from its join
//! datagram and unicasts everything else to it, no broadcast required.

use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lanroom::runtime::messages::{FilePayload, PeerInfo};
use lanroom::runtime::node::crypto::RoomKey;
use lanroom::runtime::node::protocol::{
    self, ChunkContent, Envelope, EnvelopeKind, FileMeta, MessageContent, MessagePart,
};
use lanroom::runtime::{spawn_runtime, RuntimeEvent, RuntimeHandle};

const RECV_WINDOW: Duration = Duration::from_secs(3);
const FORGED_PEER: &str = "f00dfeed00000001";

/// A room name that is already in canonical form, random enough that test
/// runs cannot collide on a port.
fn fresh_room() -> String {
    format!("It{:08x}", rand::random::<u32>())
}

fn forge(kind: EnvelopeKind, message_id: &str, content: Option<Value>, key: &RoomKey) -> Vec<u8> {
    protocol::encode(
        Envelope {
            kind,
            message_id: message_id.into(),
            peer_id: FORGED_PEER.into(),
            display_name: "forger".into(),
            timestamp: 1,
            content,
            encrypted: None,
        },
        Some(key),
    )
}

/// Receive until an envelope of `kind` arrives. Everything else (join
/// announcements, history requests, chunk pacing noise) is skipped.
async fn recv_kind(socket: &UdpSocket, key: &RoomKey, kind: EnvelopeKind) -> Envelope {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, _) = socket.recv_from(&mut buf).await.expect("recv");
        let Ok(mut env) = protocol::decode(&buf[..len]) else {
            continue;
        };
        if protocol::open_content(&mut env, Some(key)).is_err() {
            continue;
        }
        if env.kind == kind {
            return env;
        }
    }
}

/// Pull events until the next chat message shows up.
async fn next_message(events: &mut mpsc::Receiver<RuntimeEvent>) -> Option<RuntimeEvent> {
    loop {
        match events.recv().await? {
            event @ RuntimeEvent::NewMessage(_) => return Some(event),
            _ => continue,
        }
    }
}

async fn forged_peer_in(
    handle: &RuntimeHandle,
    port: u16,
    key: &RoomKey,
) -> (UdpSocket, std::net::SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
    let target = format!("127.0.0.1:{port}").parse().unwrap();
    socket
        .send_to(&forge(EnvelopeKind::Join, "join-1", None, key), target)
        .await
        .expect("send join");

    // Wait until the node has actually registered us.
    for _ in 0..50 {
        let peers: Vec<PeerInfo> = handle.get_peers().await.expect("get peers");
        if peers.iter().any(|p| p.peer_id == FORGED_PEER) {
            return (socket, target);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node never registered the forged peer");
}

#[tokio::test]
async fn late_joiner_receives_replayed_history() {
    let room = fresh_room();
    let key = RoomKey::derive(&room);
    let (handle, _events) = spawn_runtime();
    let port = handle.join_room(&room, "alice").await.expect("join");

    handle
        .send_message(
            vec![MessagePart::Text {
                content: "hello".into(),
            }],
            vec![],
        )
        .await
        .expect("send");

    let (socket, target) = forged_peer_in(&handle, port, &key).await;
    socket
        .send_to(
            &forge(EnvelopeKind::HistoryRequest, "hist-1", None, &key),
            target,
        )
        .await
        .expect("send history request");

    let env = timeout(RECV_WINDOW, recv_kind(&socket, &key, EnvelopeKind::Message))
        .await
        .expect("history replay arrived");
    assert_eq!(env.display_name, "alice");
    let content = env.message_content().unwrap();
    assert_eq!(
        content.structure,
        vec![MessagePart::Text {
            content: "hello".into()
        }]
    );
}

#[tokio::test]
async fn incoming_message_reaches_the_shell_exactly_once() {
    let room = fresh_room();
    let key = RoomKey::derive(&room);
    let (handle, mut events) = spawn_runtime();
    let port = handle.join_room(&room, "alice").await.expect("join");
    let (socket, target) = forged_peer_in(&handle, port, &key).await;

    let content = serde_json::to_value(MessageContent {
        structure: vec![MessagePart::Text {
            content: "once only".into(),
        }],
        files: vec![],
    })
    .unwrap();
    let datagram = forge(EnvelopeKind::Message, "msg-dup", Some(content), &key);
    socket.send_to(&datagram, target).await.expect("first copy");
    socket.send_to(&datagram, target).await.expect("second copy");

    let first = timeout(RECV_WINDOW, next_message(&mut events))
        .await
        .expect("message delivered")
        .unwrap();
    if let RuntimeEvent::NewMessage(message) = first {
        assert_eq!(message.sender, "forger");
        assert_eq!(message.message_id, "msg-dup");
    }

    // The duplicate must be swallowed by the dedup cache.
    assert!(timeout(Duration::from_millis(500), next_message(&mut events))
        .await
        .is_err());
}

#[tokio::test]
async fn corrupted_auth_tag_is_dropped_silently() {
    let room = fresh_room();
    let key = RoomKey::derive(&room);
    let (handle, mut events) = spawn_runtime();
    let port = handle.join_room(&room, "alice").await.expect("join");
    let (socket, target) = forged_peer_in(&handle, port, &key).await;

    let content = serde_json::to_value(MessageContent {
        structure: vec![MessagePart::Text {
            content: "tampered".into(),
        }],
        files: vec![],
    })
    .unwrap();
    let sealed = forge(EnvelopeKind::Message, "msg-bad-tag", Some(content), &key);
    let mut wire: Value = serde_json::from_slice(&sealed).unwrap();
    wire["encrypted"]["authTag"] = Value::String("00".repeat(16));
    socket
        .send_to(&serde_json::to_vec(&wire).unwrap(), target)
        .await
        .expect("send tampered");

    assert!(timeout(Duration::from_millis(500), next_message(&mut events))
        .await
        .is_err());
}

#[tokio::test]
async fn announced_file_reassembles_from_chunks() {
    let room = fresh_room();
    let key = RoomKey::derive(&room);
    let (handle, mut events) = spawn_runtime();
    let port = handle.join_room(&room, "alice").await.expect("join");
    let (socket, target) = forged_peer_in(&handle, port, &key).await;

    let payload = "QUJDREVGR0g=";
    let content = serde_json::to_value(MessageContent {
        structure: vec![MessagePart::File { id: "file-1".into() }],
        files: vec![FileMeta {
            id: "file-1".into(),
            name: "greeting.bin".into(),
            size: payload.len() as u64,
            total_chunks: 1,
        }],
    })
    .unwrap();
    socket
        .send_to(
            &forge(EnvelopeKind::Message, "msg-file", Some(content), &key),
            target,
        )
        .await
        .expect("announce");

    let chunk = serde_json::to_value(ChunkContent {
        file_id: "file-1".into(),
        chunk_index: 0,
        chunk_data: payload.into(),
    })
    .unwrap();
    socket
        .send_to(
            &forge(EnvelopeKind::FileChunk, "chunk-0", Some(chunk), &key),
            target,
        )
        .await
        .expect("chunk");

    let received = timeout(RECV_WINDOW, async {
        loop {
            match events.recv().await {
                Some(RuntimeEvent::FileReceived { file_id, name, data }) => {
                    return (file_id, name, data)
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("file completed");

    assert_eq!(received.0, "file-1");
    assert_eq!(received.1, "greeting.bin");
    assert_eq!(received.2, payload);
}

#[tokio::test]
async fn local_file_send_streams_announce_then_chunks() {
    let room = fresh_room();
    let key = RoomKey::derive(&room);
    let (handle, _events) = spawn_runtime();
    let port = handle.join_room(&room, "alice").await.expect("join");
    let (socket, _target) = forged_peer_in(&handle, port, &key).await;

    let data = "a".repeat(100);
    handle
        .send_message(
            vec![MessagePart::File { id: "out-1".into() }],
            vec![FilePayload {
                id: "out-1".into(),
                name: "out.bin".into(),
                data: data.clone(),
            }],
        )
        .await
        .expect("send file");

    let announce = timeout(RECV_WINDOW, recv_kind(&socket, &key, EnvelopeKind::Message))
        .await
        .expect("announce arrived");
    let metas = announce.message_content().unwrap().files;
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].size, 100);
    assert_eq!(metas[0].total_chunks, 1);

    let chunk_env = timeout(
        RECV_WINDOW,
        recv_kind(&socket, &key, EnvelopeKind::FileChunk),
    )
    .await
    .expect("chunk arrived");
    let chunk = chunk_env.chunk_content().unwrap();
    assert_eq!(chunk.file_id, "out-1");
    assert_eq!(chunk.chunk_index, 0);
    assert_eq!(chunk.chunk_data, data);
}

#[tokio::test]
async fn two_nodes_in_one_room_fall_back_to_adjacent_ports() {
    let room = fresh_room();
    let (first, _events_a) = spawn_runtime();
    let (second, _events_b) = spawn_runtime();

    let port_a = first.join_room(&room, "alice").await.expect("first join");
    let port_b = second.join_room(&room, "bob").await.expect("second join");

    assert_eq!(port_b, port_a + 1);
}
