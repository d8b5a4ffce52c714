use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// One connected voice sender. Mutated only by the UDP server (activity,
/// `remote_addr`) and the router (counters).
pub struct Session {
    pub session_id: u32,
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub ssrc: u32,
    pub audio_only: bool,
    /// `exp` claim from the voice token that authenticated this session's
    /// HELLO, kept around so a later MEDIA packet arriving from an
    /// unrecorded address can be judged for rebind without re-verifying
    /// the token's signature on every packet.
    pub token_expires_at: DateTime<Utc>,
    remote_addr: parking_lot::Mutex<SocketAddr>,
    last_activity: parking_lot::Mutex<Instant>,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl Session {
    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote_addr.lock()
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock() = addr;
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the token that authenticated this session's HELLO is still
    /// within its validity window, used to judge a MEDIA-triggered address
    /// rebind (see `SessionTable::rebind_if_valid`).
    pub fn token_still_valid(&self) -> bool {
        self.token_expires_at > Utc::now()
    }
}

/// Key identifying a user's slot in a room — a user may not occupy two
/// slots in the same room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RoomUser {
    room_id: Uuid,
    user_id: Uuid,
}

struct Inner {
    by_id: HashMap<u32, Arc<Session>>,
    by_room_user: HashMap<RoomUser, u32>,
    /// Global `ssrc → session_id` index. SSRCs are allocated by the voice
    /// assigner (see `registry.rs`) from a single process-wide counter, so
    /// this index doubles as the UDP server's demultiplexing table: every
    /// MEDIA packet carries only its sender's SSRC, never a session id.
    by_ssrc: HashMap<u32, u32>,
    next_id: u32,
}

/// Authoritative registry of active voice senders, process-wide.
pub struct SessionTable {
    inner: RwLock<Inner>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_room_user: HashMap::new(),
                by_ssrc: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        remote_addr: SocketAddr,
        ssrc: u32,
        audio_only: bool,
        token_expires_at: DateTime<Utc>,
    ) -> AppResult<Arc<Session>> {
        let mut inner = self.inner.write().await;

        let key = RoomUser { room_id, user_id };
        if inner.by_room_user.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "user {user_id} already has a session in room {room_id}"
            )));
        }
        if inner.by_ssrc.contains_key(&ssrc) {
            return Err(AppError::Conflict(format!("ssrc {ssrc} already in use")));
        }

        let session_id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);

        let session = Arc::new(Session {
            session_id,
            user_id,
            room_id,
            ssrc,
            audio_only,
            token_expires_at,
            remote_addr: parking_lot::Mutex::new(remote_addr),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        });

        inner.by_room_user.insert(key, session_id);
        inner.by_ssrc.insert(ssrc, session_id);
        inner.by_id.insert(session_id, session.clone());

        Ok(session)
    }

    pub async fn get_by_id(&self, session_id: u32) -> Option<Arc<Session>> {
        self.inner.read().await.by_id.get(&session_id).cloned()
    }

    pub async fn get_by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        let session_id = *inner.by_ssrc.get(&ssrc)?;
        inner.by_id.get(&session_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn touch(&self, session_id: u32) {
        if let Some(session) = self.inner.read().await.by_id.get(&session_id) {
            session.touch();
        }
    }

    /// Judge a MEDIA or HEARTBEAT packet arriving at `addr` for `session_id` whose
    /// recorded `remote_addr` differs. Rebinds and returns `true` only if
    /// the session's token is still within its validity window; otherwise
    /// leaves the session untouched and returns `false` so the caller can
    /// drop the packet.
    pub async fn rebind_if_valid(&self, session_id: u32, addr: SocketAddr) -> bool {
        let Some(session) = self.inner.read().await.by_id.get(&session_id).cloned() else {
            return false;
        };
        if session.remote_addr() == addr {
            return true;
        }
        if session.token_still_valid() {
            session.set_remote_addr(addr);
            true
        } else {
            false
        }
    }

    /// Idempotent: returns the removed session, if any.
    pub async fn remove(&self, session_id: u32) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.by_id.remove(&session_id)?;
        let key = RoomUser { room_id: session.room_id, user_id: session.user_id };
        inner.by_room_user.remove(&key);
        inner.by_ssrc.remove(&session.ssrc);
        Some(session)
    }

    /// Removes and returns sessions whose `last_activity` is older than
    /// `threshold`.
    pub async fn cleanup_inactive(&self, threshold: std::time::Duration) -> Vec<Arc<Session>> {
        let stale_ids: Vec<u32> = {
            let inner = self.inner.read().await;
            inner
                .by_id
                .values()
                .filter(|s| s.last_activity().elapsed() > threshold)
                .map(|s| s.session_id)
                .collect()
        };

        let mut removed = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(session) = self.remove(id).await {
                removed.push(session);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_room_user() {
        let table = SessionTable::new();
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();
        table.create(user, room, addr(), 1, false, far_future()).await.unwrap();
        let err = table.create(user, room, addr(), 2, false, far_future()).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_by_ssrc_resolves_global_index() {
        let table = SessionTable::new();
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();
        let session = table.create(user, room, addr(), 42, false, far_future()).await.unwrap();
        let found = table.get_by_ssrc(42).await.unwrap();
        assert_eq!(found.session_id, session.session_id);
    }

    #[tokio::test]
    async fn remove_frees_all_indexes_for_reuse() {
        let table = SessionTable::new();
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();
        let session = table.create(user, room, addr(), 7, false, far_future()).await.unwrap();
        table.remove(session.session_id).await;
        assert!(table.get_by_ssrc(7).await.is_none());
        assert!(table.get_by_id(session.session_id).await.is_none());
        // the same (room, user) and ssrc can now be reused
        table.create(user, room, addr(), 7, false, far_future()).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_inactive_removes_only_stale_sessions() {
        let table = SessionTable::new();
        let room = Uuid::now_v7();
        let fresh = table
            .create(Uuid::now_v7(), room, addr(), 1, false, far_future())
            .await
            .unwrap();
        let stale = table
            .create(Uuid::now_v7(), room, addr(), 2, false, far_future())
            .await
            .unwrap();
        // Can't rewind a real Instant in a unit test without unsafe trickery;
        // simulate staleness with a zero threshold against the fresh one
        // instead, and a long threshold against the other, to exercise both
        // branches of the filter.
        let removed_none = table.cleanup_inactive(Duration::from_secs(3600)).await;
        assert!(removed_none.is_empty());

        let removed_all = table.cleanup_inactive(Duration::from_secs(0)).await;
        let removed_ids: Vec<u32> = removed_all.iter().map(|s| s.session_id).collect();
        assert!(removed_ids.contains(&fresh.session_id));
        assert!(removed_ids.contains(&stale.session_id));
    }

    #[tokio::test]
    async fn rebind_if_valid_updates_addr_only_when_token_unexpired() {
        let table = SessionTable::new();
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();
        let session = table.create(user, room, addr(), 9, false, far_future()).await.unwrap();
        let new_addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        assert!(table.rebind_if_valid(session.session_id, new_addr).await);
        assert_eq!(session.remote_addr(), new_addr);

        let expired = table
            .create(Uuid::now_v7(), room, addr(), 10, false, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let other_addr: SocketAddr = "127.0.0.1:9200".parse().unwrap();
        assert!(!table.rebind_if_valid(expired.session_id, other_addr).await);
        assert_eq!(expired.remote_addr(), addr());
    }
}
