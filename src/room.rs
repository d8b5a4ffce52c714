use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::Session;

/// One voice room's switching fabric: the set of active sessions plus two
/// secondary indexes that must always agree with it.
struct Room {
    sessions: HashMap<u32, Arc<Session>>,
    by_user: HashMap<Uuid, u32>,
    by_ssrc: HashMap<u32, u32>,
}

impl Room {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            by_ssrc: HashMap::new(),
        }
    }

    fn add(&mut self, session: Arc<Session>) {
        self.by_user.insert(session.user_id, session.session_id);
        self.by_ssrc.insert(session.ssrc, session.session_id);
        self.sessions.insert(session.session_id, session);
    }

    fn remove(&mut self, session_id: u32) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&session_id)?;
        self.by_user.remove(&session.user_id);
        self.by_ssrc.remove(&session.ssrc);
        Some(session)
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// `room_id → Room`, lazily created on first admission and reaped when the
/// last session leaves.
#[derive(Default)]
pub struct RoomIndex {
    rooms: RwLock<HashMap<Uuid, Room>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `session` into its `room_id`'s room, creating the room if this
    /// is its first member.
    pub async fn add(&self, session: Arc<Session>) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(session.room_id).or_insert_with(Room::new).add(session);
    }

    /// Idempotent. Reaps the room if `session_id` was its last member.
    pub async fn remove(&self, room_id: Uuid, session_id: u32) -> Option<Arc<Session>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id)?;
        let removed = room.remove(session_id);
        if room.is_empty() {
            rooms.remove(&room_id);
        }
        removed
    }

    pub async fn lookup_by_user(&self, room_id: Uuid, user_id: Uuid) -> Option<Arc<Session>> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&room_id)?;
        let session_id = *room.by_user.get(&user_id)?;
        room.sessions.get(&session_id).cloned()
    }

    pub async fn lookup_by_ssrc(&self, room_id: Uuid, ssrc: u32) -> Option<Arc<Session>> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&room_id)?;
        let session_id = *room.by_ssrc.get(&ssrc)?;
        room.sessions.get(&session_id).cloned()
    }

    /// Stable snapshot of a room's current members. Copies out from under
    /// the read lock so the caller never holds it across I/O (the router
    /// forwards media to every address in this list without the lock held).
    pub async fn members(&self, room_id: Uuid) -> Vec<Arc<Session>> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&room_id)
            .map(|room| room.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn session_count(&self, room_id: Uuid) -> usize {
        self.rooms.read().await.get(&room_id).map(|r| r.sessions.len()).unwrap_or(0)
    }
}
