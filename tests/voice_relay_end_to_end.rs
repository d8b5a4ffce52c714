use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use concord::room::RoomIndex;
use concord::session::SessionTable;
use concord::token::VoiceTokenCodec;
use concord::voice_udp::VoiceUdpServer;
use tokio::net::UdpSocket;
use uuid::Uuid;

async fn spawn_relay() -> (Arc<VoiceUdpServer>, std::net::SocketAddr, VoiceTokenCodec) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let tokens = VoiceTokenCodec::new("shared-secret".into(), None, 3600);
    let server = Arc::new(VoiceUdpServer::new(
        socket,
        Arc::new(SessionTable::new()),
        Arc::new(RoomIndex::new()),
        Arc::new(tokens.clone()),
        Duration::from_secs(120),
    ));

    let (_tx, rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(server.clone().run(rx));

    (server, addr, tokens)
}

fn hello_packet(token: &str) -> Vec<u8> {
    let mut packet = vec![0x01u8];
    packet.extend_from_slice(token.as_bytes());
    packet
}

fn media_packet(ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x10u8];
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// §8 scenario 1: two-party relay. A sends MEDIA; B receives exactly one
/// datagram carrying A's SSRC and payload; A receives nothing back.
#[tokio::test]
async fn two_party_relay_forwards_to_the_other_party_only() {
    let (_server, relay_addr, tokens) = spawn_relay().await;
    let room_id = Uuid::now_v7();

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let token_a = tokens.issue("node-1", room_id, Uuid::now_v7(), 100, false).unwrap();
    let token_b = tokens.issue("node-1", room_id, Uuid::now_v7(), 200, false).unwrap();

    client_a.send_to(&hello_packet(&token_a), relay_addr).await.unwrap();
    client_b.send_to(&hello_packet(&token_b), relay_addr).await.unwrap();

    // Drain both HELLO-ACKs.
    let mut buf = [0u8; 64];
    client_a.recv_from(&mut buf).await.unwrap();
    client_b.recv_from(&mut buf).await.unwrap();

    client_a.send_to(&media_packet(100, b"audio-frame-1"), relay_addr).await.unwrap();

    let (n, _) = client_b.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], media_packet(100, b"audio-frame-1").as_slice());

    let result = tokio::time::timeout(Duration::from_millis(100), client_a.recv_from(&mut buf)).await;
    assert!(result.is_err(), "sender A should receive nothing back");
}

/// §8 scenario 2: cleanup. A session idle past the timeout is evicted and
/// a subsequent MEDIA from its old session is dropped rather than routed.
#[tokio::test]
async fn cleanup_evicts_inactive_sessions() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let relay_addr = socket.local_addr().unwrap();
    let tokens = VoiceTokenCodec::new("shared-secret".into(), None, 3600);
    let sessions = Arc::new(SessionTable::new());
    let rooms = Arc::new(RoomIndex::new());
    let server = Arc::new(VoiceUdpServer::new(
        socket,
        sessions.clone(),
        rooms.clone(),
        Arc::new(tokens.clone()),
        Duration::from_millis(0),
    ));

    let (_tx, rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(server.clone().run(rx));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let token = tokens.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 55, false).unwrap();
    client.send_to(&hello_packet(&token), relay_addr).await.unwrap();
    let mut buf = [0u8; 64];
    client.recv_from(&mut buf).await.unwrap();
    assert_eq!(sessions.count().await, 1);

    let removed = sessions.cleanup_inactive(Duration::from_millis(0)).await;
    assert_eq!(removed.len(), 1);
    assert_eq!(sessions.count().await, 0);

    client.send_to(&media_packet(55, b"late-frame"), relay_addr).await.unwrap();
    let result = tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "media from an evicted session must be dropped, not routed back");
}

/// §8 boundary: a HELLO whose token is already past `exp` is rejected —
/// no session is created and no ACK is sent.
#[tokio::test]
async fn hello_with_expired_token_is_rejected() {
    let (server, relay_addr, _default_tokens) = spawn_relay().await;
    let expired_tokens = VoiceTokenCodec::new("shared-secret".into(), None, 0);
    let token = expired_tokens.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 1, false).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&hello_packet(&token), relay_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(Duration::from_millis(150), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expired HELLO must get no ACK");
    assert_eq!(server.sessions().count().await, 0);
}

/// §8 boundary: a MEDIA packet carrying the right SSRC but arriving from an
/// unrecorded address rebinds only while the token is still valid.
#[tokio::test]
async fn media_from_new_address_rebinds_only_while_token_valid() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let relay_addr = socket.local_addr().unwrap();
    let sessions = Arc::new(SessionTable::new());
    let rooms = Arc::new(RoomIndex::new());
    let tokens = VoiceTokenCodec::new("shared-secret".into(), None, 3600);
    let server = Arc::new(VoiceUdpServer::new(socket, sessions.clone(), rooms, Arc::new(tokens.clone()), Duration::from_secs(120)));

    let (_tx, rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(server.clone().run(rx));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let token = tokens.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 77, false).unwrap();
    client.send_to(&hello_packet(&token), relay_addr).await.unwrap();
    let mut buf = [0u8; 64];
    client.recv_from(&mut buf).await.unwrap();

    let second_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second_client.send_to(&media_packet(77, b"from-new-addr"), relay_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = sessions.get_by_ssrc(77).await.unwrap();
    assert_eq!(session.remote_addr(), second_client.local_addr().unwrap());
}
