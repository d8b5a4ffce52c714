use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::room::RoomIndex;
use crate::session::SessionTable;

/// Locally measured stats a voice node reports on each heartbeat. CPU is a
/// coarse load proxy rather than a precise measurement, matching the
/// source's "goroutine-based CPU proxy" note — any cheap, monotone-with-load
/// signal satisfies the contract.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NodeStats {
    pub active_rooms: u32,
    pub active_sessions: u32,
    pub cpu_fraction: f64,
    pub outbound_mbps: f64,
}

/// Abstracts the RPC calls a registrar makes against the control plane, so
/// the heartbeat loop is testable without a live HTTP server. The real
/// implementation (`HttpVoiceRegistrarClient`) talks to the control plane's
/// registry endpoints over `reqwest`.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register_server(
        &self,
        server_id: &str,
        region: &str,
        addr_udp: &str,
        addr_ctrl: &str,
        capacity_hint: u32,
    ) -> anyhow::Result<()>;

    async fn heartbeat(&self, server_id: &str, stats: NodeStats) -> anyhow::Result<()>;
}

/// `reqwest`-backed `RegistryClient` talking to the control plane's registry
/// endpoints, standing in for the §6 `RegisterServer`/`Heartbeat` RPCs.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRegistryClient {
    pub fn new(base_url: String) -> Self {
        Self { http: reqwest::Client::new(), base_url }
    }
}

#[derive(Serialize)]
struct RegisterServerBody<'a> {
    server_id: &'a str,
    region: &'a str,
    addr_udp: &'a str,
    addr_ctrl: &'a str,
    capacity_hint: u32,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    server_id: &'a str,
    #[serde(flatten)]
    stats: NodeStats,
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn register_server(
        &self,
        server_id: &str,
        region: &str,
        addr_udp: &str,
        addr_ctrl: &str,
        capacity_hint: u32,
    ) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/v1/voice-servers", self.base_url))
            .json(&RegisterServerBody { server_id, region, addr_udp, addr_ctrl, capacity_hint })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str, stats: NodeStats) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/v1/voice-servers/{server_id}/heartbeat", self.base_url))
            .json(&HeartbeatBody { server_id, stats })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Derives `NodeStats` from the voice node's own live tables, so the
/// registrar's heartbeat loop never needs direct knowledge of
/// `SessionTable`/`RoomIndex` internals.
pub struct LocalStatsSource {
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomIndex>,
    bytes_sent_baseline: AtomicU64,
}

impl LocalStatsSource {
    pub fn new(sessions: Arc<SessionTable>, rooms: Arc<RoomIndex>) -> Self {
        Self { sessions, rooms, bytes_sent_baseline: AtomicU64::new(0) }
    }

    /// Crude CPU proxy: the fraction of configured capacity the node is
    /// currently carrying, clamped to 1.0. A full deployment would source
    /// this from the OS; that's out of core scope.
    pub async fn snapshot(&self, capacity_hint: u32, heartbeat_interval: Duration) -> NodeStats {
        let sessions = self.sessions.get_all().await;
        let active_sessions = sessions.len() as u32;
        let active_rooms = self.rooms.room_count().await as u32;

        let total_bytes_sent: u64 = sessions.iter().map(|s| s.bytes_sent.load(Ordering::Relaxed)).sum();
        let baseline = self.bytes_sent_baseline.swap(total_bytes_sent, Ordering::Relaxed);
        let delta = total_bytes_sent.saturating_sub(baseline);
        let outbound_mbps = (delta as f64 * 8.0 / 1_000_000.0) / heartbeat_interval.as_secs_f64().max(1.0);

        let cpu_fraction = if capacity_hint == 0 {
            0.0
        } else {
            (active_sessions as f64 / capacity_hint as f64).min(1.0)
        };

        NodeStats { active_rooms, active_sessions, cpu_fraction, outbound_mbps }
    }
}

/// Lives inside each voice node. Registers on boot and emits periodic
/// heartbeats with live stats. Heartbeat failures are logged and retried on
/// the next tick; the 30 s cadence is slow enough that no backoff is
/// needed, per §4.7.
pub struct VoiceRegistrar {
    client: Arc<dyn RegistryClient>,
    stats: Arc<LocalStatsSource>,
    server_id: String,
    region: String,
    addr_udp: String,
    addr_ctrl: String,
    capacity_hint: u32,
}

impl VoiceRegistrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn RegistryClient>,
        stats: Arc<LocalStatsSource>,
        server_id: String,
        region: String,
        addr_udp: String,
        addr_ctrl: String,
        capacity_hint: u32,
    ) -> Self {
        Self { client, stats, server_id, region, addr_udp, addr_ctrl, capacity_hint }
    }

    pub async fn register(&self) -> anyhow::Result<()> {
        self.client
            .register_server(&self.server_id, &self.region, &self.addr_udp, &self.addr_ctrl, self.capacity_hint)
            .await?;
        tracing::info!(server_id = %self.server_id, "voice node registered with control plane");
        Ok(())
    }

    /// Runs the 30 s heartbeat loop until shutdown. A failed heartbeat is
    /// logged and simply retried next tick.
    pub async fn run_heartbeat_loop(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.stats.snapshot(self.capacity_hint, interval).await;
                    if let Err(e) = self.client.heartbeat(&self.server_id, stats).await {
                        tracing::warn!(server_id = %self.server_id, error = %e, "voice registrar heartbeat failed, retrying next tick");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(server_id = %self.server_id, "voice registrar heartbeat loop shutting down");
                    return;
                }
            }
        }
    }
}
