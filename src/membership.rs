use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Looks up which rooms a user belongs to, so the hub can auto-subscribe a
/// newly connected client. In a full deployment this is backed by the SQL
/// membership repository; that repository is out of core scope here, so
/// only the interface and an in-memory stand-in live in this crate.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn rooms_for_user(&self, user_id: Uuid) -> Vec<Uuid>;
}

/// Marks a user offline (and clears any ephemeral presence state) once its
/// stream endpoint disconnects. In a full deployment this is backed by a
/// presence service, itself out of core scope.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn mark_online(&self, user_id: Uuid);
    async fn mark_offline(&self, user_id: Uuid);
}

/// Reference `MembershipSource` backed by a plain in-process map, good
/// enough for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMembership {
    by_user: DashMap<Uuid, Vec<Uuid>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rooms(&self, user_id: Uuid, rooms: Vec<Uuid>) {
        self.by_user.insert(user_id, rooms);
    }

    pub fn add_room(&self, user_id: Uuid, room_id: Uuid) {
        self.by_user.entry(user_id).or_default().push(room_id);
    }
}

#[async_trait]
impl MembershipSource for InMemoryMembership {
    async fn rooms_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        self.by_user.get(&user_id).map(|v| v.clone()).unwrap_or_default()
    }
}

/// Reference `PresenceSink`, grounded in the same DashMap-per-status shape
/// used for the chat gateway's presence manager.
#[derive(Default)]
pub struct InMemoryPresence {
    statuses: DashMap<Uuid, bool>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.statuses.get(&user_id).map(|v| *v).unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<Uuid, bool> {
        self.statuses.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[async_trait]
impl PresenceSink for InMemoryPresence {
    async fn mark_online(&self, user_id: Uuid) {
        self.statuses.insert(user_id, true);
    }

    async fn mark_offline(&self, user_id: Uuid) {
        self.statuses.insert(user_id, false);
    }
}

/// Bundle of external collaborators a hub/stream endpoint needs, so call
/// sites take one `Arc<Collaborators>` instead of threading two traits
/// through every constructor.
pub struct Collaborators {
    pub membership: Arc<dyn MembershipSource>,
    pub presence: Arc<dyn PresenceSink>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            membership: Arc::new(InMemoryMembership::new()),
            presence: Arc::new(InMemoryPresence::new()),
        }
    }
}
