use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::room::RoomIndex;
use crate::router::VoiceRouter;
use crate::session::SessionTable;
use crate::token::VoiceTokenCodec;
use crate::udp_wire::{self, DecodeError, InboundPacket, MAX_DATAGRAM_SIZE};

/// Counters surfaced by the cleanup sweep's periodic log line and, in a
/// full deployment, by a metrics exporter outside core scope.
#[derive(Default)]
pub struct UdpMetrics {
    pub packets_malformed: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub tokens_rejected: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_expired: AtomicU64,
}

/// Binds the media socket, runs the HELLO/ACK/HEARTBEAT state machine,
/// demultiplexes MEDIA packets to the router, and periodically evicts
/// inactive sessions. See spec §4.4.
pub struct VoiceUdpServer {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomIndex>,
    router: Arc<VoiceRouter>,
    tokens: Arc<VoiceTokenCodec>,
    pub metrics: Arc<UdpMetrics>,
    session_timeout: Duration,
}

impl VoiceUdpServer {
    pub fn new(
        socket: Arc<UdpSocket>,
        sessions: Arc<SessionTable>,
        rooms: Arc<RoomIndex>,
        tokens: Arc<VoiceTokenCodec>,
        session_timeout: Duration,
    ) -> Self {
        let router = Arc::new(VoiceRouter::new(sessions.clone(), rooms.clone(), socket.clone()));
        Self {
            socket,
            sessions,
            rooms,
            router,
            tokens,
            metrics: Arc::new(UdpMetrics::default()),
            session_timeout,
        }
    }

    /// Runs the receive loop until a socket error or shutdown signal.
    /// Socket errors on receive terminate the loop with an error surfaced
    /// to the process supervisor, per §4.4.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((n, addr)) => {
                            if n > MAX_DATAGRAM_SIZE {
                                self.metrics.packets_malformed.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            self.handle_packet(&buf[..n], addr).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "voice udp recv_from failed, terminating");
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("voice udp server received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        match udp_wire::decode(data) {
            Ok(InboundPacket::Hello { token }) => self.handle_hello(token, addr).await,
            Ok(InboundPacket::Heartbeat { session_id }) => self.handle_heartbeat(session_id, addr).await,
            Ok(InboundPacket::Bye { session_id }) => self.handle_bye(session_id, addr).await,
            Ok(InboundPacket::Media { ssrc, payload }) => self.handle_media(ssrc, payload, addr).await,
            Err(DecodeError::UnknownTag(tag)) => {
                tracing::debug!(tag, %addr, "dropping packet with unknown type tag");
                self.metrics.packets_malformed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(error = %e, %addr, "dropping malformed packet");
                self.metrics.packets_malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// `New → Authenticated`. Invalid tokens get no reply — a negative ACK
    /// would let an attacker use this socket as a UDP amplifier.
    async fn handle_hello(&self, token: &str, addr: SocketAddr) {
        let claims = match self.tokens.verify(token) {
            Ok(claims) => claims,
            Err(_) => {
                self.metrics.tokens_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%addr, "hello: invalid or expired voice token");
                return;
            }
        };

        let Some(expires_at) = Utc.timestamp_opt(claims.exp, 0).single() else {
            self.metrics.tokens_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if expires_at <= Utc::now() {
            self.metrics.tokens_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%addr, user_id = %claims.user_id, "hello: token past expiry");
            return;
        }

        let session = match self
            .sessions
            .create(claims.user_id, claims.room_id, addr, claims.ssrc, claims.audio_only, expires_at)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                // Duplicate (room, user) or ssrc collision — drop silently,
                // same amplification-avoidance rationale as an invalid token.
                tracing::warn!(%addr, error = %e, "hello: session admission failed");
                return;
            }
        };
        self.rooms.add(session.clone()).await;
        self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            session_id = session.session_id,
            room_id = %session.room_id,
            user_id = %session.user_id,
            ssrc = session.ssrc,
            "voice session created"
        );

        let ack = udp_wire::encode_hello_ack(session.session_id, session.ssrc);
        if let Err(e) = self.socket.try_send_to(&ack, addr) {
            tracing::warn!(%addr, error = %e, "failed to send HELLO-ACK");
        }
    }

    /// `Authenticated → Authenticated`: touch and reply. A source address
    /// that no longer matches the recorded one is rebound under the same
    /// token-gated rule `handle_media` uses, rather than dropped outright —
    /// §4.4 doesn't condition HEARTBEAT on address match, and a NAT
    /// remapping that happens to arrive as a heartbeat first must not stall
    /// `last_activity` and get the session reaped out from under a client
    /// that's still alive.
    async fn handle_heartbeat(&self, session_id: u32, addr: SocketAddr) {
        let Some(session) = self.sessions.get_by_id(session_id).await else {
            self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if session.remote_addr() != addr && !self.sessions.rebind_if_valid(session_id, addr).await {
            self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sessions.touch(session_id).await;
        let ack = udp_wire::encode_heartbeat_ack();
        let _ = self.socket.try_send_to(&ack, addr);
    }

    /// `Authenticated → Dead` on explicit BYE.
    async fn handle_bye(&self, session_id: u32, addr: SocketAddr) {
        let Some(session) = self.sessions.get_by_id(session_id).await else {
            self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if session.remote_addr() != addr {
            self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sessions.remove(session_id).await;
        self.rooms.remove(session.room_id, session_id).await;
        tracing::info!(session_id, "voice session closed by BYE");
    }

    /// Demultiplexes by SSRC (globally unique, allocated by the assigner)
    /// rather than by source address, so a NAT rebind doesn't orphan the
    /// packet. `New` state (unknown SSRC) is dropped per §4.4.
    async fn handle_media(&self, ssrc: u32, payload: &[u8], addr: SocketAddr) {
        let Some(session) = self.sessions.get_by_ssrc(ssrc).await else {
            self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if session.remote_addr() != addr {
            let rebound = self.sessions.rebind_if_valid(session.session_id, addr).await;
            if !rebound {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = session.session_id,
                    %addr,
                    "media: address mismatch and token no longer valid, dropping"
                );
                return;
            }
            tracing::debug!(session_id = session.session_id, %addr, "media: rebound to new source address");
        }

        self.sessions.touch(session.session_id).await;

        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&ssrc.to_be_bytes());
        framed.extend_from_slice(payload);
        self.router.route(session.session_id, &framed).await;
    }

    /// Periodic sweep (≈30s cadence): evicts sessions idle past the
    /// configured timeout and logs the count. Runs until shutdown.
    pub async fn run_cleanup_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sessions.cleanup_inactive(self.session_timeout).await;
                    for session in &removed {
                        self.rooms.remove(session.room_id, session.session_id).await;
                    }
                    if !removed.is_empty() {
                        self.metrics.sessions_expired.fetch_add(removed.len() as u64, Ordering::Relaxed);
                        tracing::info!(count = removed.len(), "cleanup: removed inactive voice sessions");
                    }
                    tracing::debug!(
                        active_sessions = self.sessions.count().await,
                        active_rooms = self.rooms.room_count().await,
                        "voice gauges refreshed"
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("voice cleanup loop received shutdown signal");
                    return;
                }
            }
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::VoiceTokenCodec;
    use uuid::Uuid;

    async fn server_pair() -> (Arc<VoiceUdpServer>, UdpSocket, Arc<VoiceTokenCodec>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(socket.local_addr().unwrap()).await.unwrap();
        let tokens = Arc::new(VoiceTokenCodec::new("secret".into(), None, 3600));
        let server = Arc::new(VoiceUdpServer::new(
            socket,
            Arc::new(SessionTable::new()),
            Arc::new(RoomIndex::new()),
            tokens.clone(),
            Duration::from_secs(120),
        ));
        (server, client, tokens)
    }

    #[tokio::test]
    async fn hello_with_valid_token_creates_a_session_and_acks() {
        let (server, client, tokens) = server_pair().await;
        let room_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let token = tokens.issue("node-1", room_id, user_id, 100, false).unwrap();

        server.handle_hello(&token, client.local_addr().unwrap()).await;

        assert_eq!(server.sessions().count().await, 1);
        let session = server.sessions().get_by_ssrc(100).await.unwrap();
        assert_eq!(session.room_id, room_id);
        assert_eq!(session.user_id, user_id);
    }

    #[tokio::test]
    async fn hello_with_invalid_token_creates_no_session() {
        let (server, client, _tokens) = server_pair().await;
        let forged = VoiceTokenCodec::new("wrong-secret".into(), None, 3600)
            .issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 1, false)
            .unwrap();
        server.handle_hello(&forged, client.local_addr().unwrap()).await;
        assert_eq!(server.sessions().count().await, 0);
        assert_eq!(server.metrics.tokens_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn media_for_unknown_ssrc_is_dropped() {
        let (server, client, _tokens) = server_pair().await;
        server.handle_media(999, b"payload", client.local_addr().unwrap()).await;
        assert_eq!(server.metrics.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn heartbeat_from_matching_address_touches_the_session() {
        let (server, client, tokens) = server_pair().await;
        let token = tokens.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 7, false).unwrap();
        server.handle_hello(&token, client.local_addr().unwrap()).await;
        let session = server.sessions().get_by_ssrc(7).await.unwrap();
        let before = session.last_activity();

        tokio::time::sleep(Duration::from_millis(5)).await;
        server.handle_heartbeat(session.session_id, client.local_addr().unwrap()).await;
        assert!(session.last_activity() > before);
    }

    #[tokio::test]
    async fn heartbeat_from_new_address_rebinds_and_touches_while_token_valid() {
        let (server, client, tokens) = server_pair().await;
        let token = tokens.issue("node-1", Uuid::now_v7(), Uuid::now_v7(), 8, false).unwrap();
        server.handle_hello(&token, client.local_addr().unwrap()).await;
        let session = server.sessions().get_by_ssrc(8).await.unwrap();
        let before = session.last_activity();

        let new_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        server.handle_heartbeat(session.session_id, new_client.local_addr().unwrap()).await;

        assert_eq!(session.remote_addr(), new_client.local_addr().unwrap());
        assert!(session.last_activity() > before);
        assert_eq!(server.metrics.packets_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn bye_removes_the_session_from_both_indexes() {
        let (server, client, tokens) = server_pair().await;
        let room_id = Uuid::now_v7();
        let token = tokens.issue("node-1", room_id, Uuid::now_v7(), 55, false).unwrap();
        server.handle_hello(&token, client.local_addr().unwrap()).await;
        let session = server.sessions().get_by_ssrc(55).await.unwrap();

        server.handle_bye(session.session_id, client.local_addr().unwrap()).await;
        assert!(server.sessions().get_by_ssrc(55).await.is_none());
        assert!(server.rooms().members(room_id).await.is_empty());
    }
}
