use std::sync::Arc;
use std::time::Duration;

use concord::registry::{HeartbeatStats, VoiceAssigner, VoiceRegistry};
use concord::token::VoiceTokenCodec;
use uuid::Uuid;

fn stats(sessions: u32) -> HeartbeatStats {
    // sessions dominate load_score at weight 0.4, so picking a session
    // count that backs out to the scenario's target score keeps the math
    // readable without needing the other three inputs.
    HeartbeatStats { active_rooms: 0, active_sessions: sessions, cpu_fraction: 0.0, outbound_mbps: 0.0 }
}

/// §8 scenario 5: three online servers at load_scores {2.0, 1.0, 3.0}.
/// `assign` picks the second (lowest); after a heartbeat bumps it to 4.0,
/// the next `assign` for a different room/user picks the first.
#[tokio::test]
async fn assigner_tracks_load_scores_across_heartbeats() {
    let registry = Arc::new(VoiceRegistry::new(Duration::from_secs(30)));
    for id in ["server-a", "server-b", "server-c"] {
        registry.upsert(id.into(), "us-east".into(), format!("{id}:5000"), format!("{id}:8080"), 500).await;
    }
    registry.heartbeat("server-a", stats((2.0 / 0.4) as u32)).await.unwrap();
    registry.heartbeat("server-b", stats((1.0 / 0.4) as u32)).await.unwrap();
    registry.heartbeat("server-c", stats((3.0 / 0.4) as u32)).await.unwrap();

    let tokens = Arc::new(VoiceTokenCodec::new("shared-secret".into(), None, 3600));
    let assigner = VoiceAssigner::new(registry.clone(), tokens);

    let first = assigner.assign(Uuid::now_v7(), Uuid::now_v7(), false, None).await.unwrap();
    assert_eq!(first.server_id, "server-b");

    registry.heartbeat("server-b", stats((4.0 / 0.4) as u32)).await.unwrap();

    let second = assigner.assign(Uuid::now_v7(), Uuid::now_v7(), false, None).await.unwrap();
    assert_eq!(second.server_id, "server-a");
}

/// §8 round-trip law: `assign` immediately followed by a HELLO with the
/// returned token yields a session with the exact SSRC claimed in the token.
#[tokio::test]
async fn assignment_token_round_trips_its_claimed_ssrc() {
    let registry = Arc::new(VoiceRegistry::new(Duration::from_secs(30)));
    registry.upsert("server-a".into(), "us-east".into(), "127.0.0.1:5000".into(), "127.0.0.1:8080".into(), 100).await;
    registry.heartbeat("server-a", stats(1)).await.unwrap();

    let tokens = Arc::new(VoiceTokenCodec::new("shared-secret".into(), None, 3600));
    let assigner = VoiceAssigner::new(registry, tokens.clone());

    let room_id = Uuid::now_v7();
    let user_id = Uuid::now_v7();
    let assignment = assigner.assign(room_id, user_id, false, None).await.unwrap();

    let claims = tokens.verify(&assignment.token).unwrap();
    assert_eq!(claims.ssrc, assignment.ssrc);
    assert_eq!(claims.room_id, room_id);
    assert_eq!(claims.user_id, user_id);
}

/// Unavailable error when no voice server is registered at all.
#[tokio::test]
async fn assign_with_no_servers_returns_unavailable() {
    let registry = Arc::new(VoiceRegistry::new(Duration::from_secs(30)));
    let tokens = Arc::new(VoiceTokenCodec::new("shared-secret".into(), None, 3600));
    let assigner = VoiceAssigner::new(registry, tokens);

    let err = assigner.assign(Uuid::now_v7(), Uuid::now_v7(), false, None).await.unwrap_err();
    assert!(matches!(err, concord::error::AppError::Unavailable(_)));
}
