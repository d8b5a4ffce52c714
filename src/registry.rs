use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::token::VoiceTokenCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Online,
    Draining,
    Offline,
}

/// One node in the voice fleet, as tracked by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServer {
    pub server_id: String,
    pub region: String,
    pub addr_udp: String,
    pub addr_ctrl: String,
    pub status: ServerStatus,
    pub capacity_hint: u32,
    pub load_score: f64,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Live stats reported by a voice node's heartbeat, used to recompute
/// `load_score`.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatStats {
    pub active_rooms: u32,
    pub active_sessions: u32,
    pub cpu_fraction: f64,
    pub outbound_mbps: f64,
}

fn load_score(stats: HeartbeatStats) -> f64 {
    0.4 * stats.active_sessions as f64
        + 0.3 * stats.active_rooms as f64
        + 0.2 * stats.cpu_fraction
        + 0.1 * stats.outbound_mbps
}

/// Authoritative record of registered voice servers. Read-time staleness
/// coercion (mandated by §9) treats any record whose `updated_at` is older
/// than `2 * heartbeat_interval` as `Offline` on every `list()` call,
/// without mutating the stored record — mutation only happens through
/// `heartbeat`/`deregister`, or the optional sweeper below.
pub struct VoiceRegistry {
    servers: RwLock<HashMap<String, VoiceServer>>,
    heartbeat_interval: Duration,
}

impl VoiceRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self { servers: RwLock::new(HashMap::new()), heartbeat_interval }
    }

    fn is_stale(&self, record: &VoiceServer) -> bool {
        let staleness = Utc::now().signed_duration_since(record.updated_at);
        staleness > chrono::Duration::from_std(self.heartbeat_interval * 2).unwrap_or_default()
    }

    /// Idempotent by `server_id`: a second registration refreshes the
    /// record's addresses/region in place rather than erroring.
    pub async fn upsert(
        &self,
        server_id: String,
        region: String,
        addr_udp: String,
        addr_ctrl: String,
        capacity_hint: u32,
    ) {
        let now = Utc::now();
        let mut servers = self.servers.write().await;
        servers
            .entry(server_id.clone())
            .and_modify(|s| {
                s.region = region.clone();
                s.addr_udp = addr_udp.clone();
                s.addr_ctrl = addr_ctrl.clone();
                s.capacity_hint = capacity_hint;
                s.status = ServerStatus::Online;
                s.updated_at = now;
            })
            .or_insert(VoiceServer {
                server_id,
                region,
                addr_udp,
                addr_ctrl,
                status: ServerStatus::Online,
                capacity_hint,
                load_score: 0.0,
                registered_at: now,
                updated_at: now,
            });
    }

    pub async fn heartbeat(&self, server_id: &str, stats: HeartbeatStats) -> AppResult<()> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(server_id)
            .ok_or_else(|| AppError::NotFound(format!("voice server {server_id} not registered")))?;
        server.load_score = load_score(stats);
        server.status = ServerStatus::Online;
        server.updated_at = Utc::now();
        Ok(())
    }

    pub async fn deregister(&self, server_id: &str) {
        if let Some(server) = self.servers.write().await.get_mut(server_id) {
            server.status = ServerStatus::Offline;
        }
    }

    /// Returns online servers, optionally region-filtered, ascending by
    /// `load_score`. Stale records are coerced to `Offline` here without
    /// mutating the stored copy.
    pub async fn list(&self, region: Option<&str>) -> Vec<VoiceServer> {
        let servers = self.servers.read().await;
        let mut online: Vec<VoiceServer> = servers
            .values()
            .cloned()
            .map(|mut s| {
                if s.status == ServerStatus::Online && self.is_stale(&s) {
                    s.status = ServerStatus::Offline;
                }
                s
            })
            .filter(|s| s.status == ServerStatus::Online)
            .filter(|s| region.map(|r| r == s.region).unwrap_or(true))
            .collect();
        online.sort_by(|a, b| a.load_score.partial_cmp(&b.load_score).unwrap_or(std::cmp::Ordering::Equal));
        online
    }

    /// Periodic sweep flipping stale `Online` records to `Offline` in
    /// place, the "nice-to-have" sweeper noted in §9 — `list()`'s read-time
    /// coercion is the load-bearing mechanism; this only keeps the stored
    /// state from lingering indefinitely for callers that inspect it
    /// directly rather than through `list()`.
    pub async fn sweep_stale(&self) -> usize {
        let mut servers = self.servers.write().await;
        let mut count = 0;
        for server in servers.values_mut() {
            if server.status == ServerStatus::Online && self.is_stale(server) {
                server.status = ServerStatus::Offline;
                count += 1;
            }
        }
        count
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep_stale().await;
                    if swept > 0 {
                        tracing::info!(count = swept, "voice registry sweeper marked stale servers offline");
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

/// One cached assignment, keyed by `(room_id, user_id)`, so repeated
/// `assign` calls within the token's validity window return a token routing
/// to the same server, per the idempotency contract in §4.7.
struct CachedAssignment {
    server_id: String,
    ssrc: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub server_id: String,
    pub addr_udp: String,
    pub ssrc: u32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Selects a voice server and mints the voice token authorizing a client to
/// HELLO into it. SSRCs are allocated here (assigner-allocated, per the
/// decision recorded in `DESIGN.md`) from one process-wide counter, so they
/// are globally unique across every room and server.
pub struct VoiceAssigner {
    registry: Arc<VoiceRegistry>,
    tokens: Arc<VoiceTokenCodec>,
    next_ssrc: AtomicU32,
    cache: RwLock<HashMap<(Uuid, Uuid), CachedAssignment>>,
}

impl VoiceAssigner {
    pub fn new(registry: Arc<VoiceRegistry>, tokens: Arc<VoiceTokenCodec>) -> Self {
        Self { registry, tokens, next_ssrc: AtomicU32::new(1), cache: RwLock::new(HashMap::new()) }
    }

    /// Picks the lowest-load online server, preferring `region_hint` if
    /// given and any server in that region is available.
    async fn pick_server(&self, region_hint: Option<&str>) -> AppResult<VoiceServer> {
        if let Some(region) = region_hint {
            let regional = self.registry.list(Some(region)).await;
            if let Some(server) = regional.into_iter().next() {
                return Ok(server);
            }
        }
        self.registry
            .list(None)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Unavailable("no voice server available".into()))
    }

    pub async fn assign(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        audio_only: bool,
        region_hint: Option<&str>,
    ) -> AppResult<Assignment> {
        let key = (room_id, user_id);

        if let Some(cached) = self.cache.read().await.get(&key) {
            if cached.expires_at > Utc::now() {
                let servers = self.registry.list(None).await;
                if servers.iter().any(|s| s.server_id == cached.server_id) {
                    let server = servers.into_iter().find(|s| s.server_id == cached.server_id).unwrap();
                    let token = self.tokens.issue(&server.server_id, room_id, user_id, cached.ssrc, audio_only)?;
                    return Ok(Assignment {
                        server_id: server.server_id,
                        addr_udp: server.addr_udp,
                        ssrc: cached.ssrc,
                        token,
                        expires_at: cached.expires_at,
                    });
                }
                // Cached server went offline: fall through to a fresh assignment.
            }
        }

        let server = self.pick_server(region_hint).await?;
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::Relaxed);
        let token = self.tokens.issue(&server.server_id, room_id, user_id, ssrc, audio_only)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(3600);

        self.cache
            .write()
            .await
            .insert(key, CachedAssignment { server_id: server.server_id.clone(), ssrc, expires_at });

        Ok(Assignment { server_id: server.server_id, addr_udp: server.addr_udp, ssrc, token, expires_at })
    }
}
