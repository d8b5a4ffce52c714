use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::ServerEvent;
use crate::membership::Collaborators;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 500;
const AUTO_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapts one live connection to whatever transport carries it (a
/// WebSocket in `stream.rs`, a mock channel in tests). The hub only ever
/// calls `send`; it never inspects the transport's internals.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, event: ServerEvent) -> anyhow::Result<()>;
}

/// One registered client: its outbound queue and the room set it is
/// currently subscribed to. `room_subs` is read under the hub's single
/// lock, never independently, per the "cleaner shape" design note.
struct ClientEntry {
    tx: mpsc::Sender<ServerEvent>,
    room_subs: HashSet<Uuid>,
    cancel: CancellationToken,
}

struct Inner {
    clients: HashMap<Uuid, ClientEntry>,
    rooms: HashMap<Uuid, HashSet<Uuid>>,
    shutting_down: bool,
}

/// Handle returned to the stream endpoint on a successful `add_client`: the
/// receiving half of the outbound queue and the cancellation token the
/// writer task observes.
pub struct ClientHandle {
    pub user_id: Uuid,
    pub rx: mpsc::Receiver<ServerEvent>,
    pub cancel: CancellationToken,
}

/// Per-process publish/subscribe matrix mapping live control-plane streams
/// to room subscriptions. One lock guards `clients` and `rooms` together,
/// per the "cleaner shape" design note: the nested map-of-maps the source
/// used invites lock-ordering bugs this avoids entirely.
pub struct EventHub {
    inner: RwLock<Inner>,
    collaborators: Arc<Collaborators>,
    pub broadcasts_sent: AtomicU64,
    pub broadcasts_dropped: AtomicU64,
}

impl EventHub {
    pub fn new(collaborators: Arc<Collaborators>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                rooms: HashMap::new(),
                shutting_down: false,
            }),
            collaborators,
            broadcasts_sent: AtomicU64::new(0),
            broadcasts_dropped: AtomicU64::new(0),
        }
    }

    /// Registers `user_id`. Last-writer-wins: a pre-existing client for the
    /// same user is cancelled and its queue closed before the new one is
    /// installed, per §9's resolution of the dual-connect question. Returns
    /// `None` if the hub is shutting down.
    pub async fn add_client(self: &Arc<Self>, user_id: Uuid) -> Option<ClientHandle> {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        {
            let mut inner = self.inner.write().await;
            if inner.shutting_down {
                return None;
            }
            if let Some(old) = inner.clients.remove(&user_id) {
                for room_id in &old.room_subs {
                    if let Some(subs) = inner.rooms.get_mut(room_id) {
                        subs.remove(&user_id);
                    }
                }
                old.cancel.cancel();
            }
            inner.clients.insert(user_id, ClientEntry { tx, room_subs: HashSet::new(), cancel: cancel.clone() });
        }

        self.collaborators.presence.mark_online(user_id).await;
        self.auto_subscribe(user_id).await;

        Some(ClientHandle { user_id, rx, cancel })
    }

    /// Enumerates the user's room memberships and subscribes to each,
    /// bounded by a 5s ceiling; if it elapses the remainder is abandoned in
    /// the background and the client is still considered connected.
    async fn auto_subscribe(self: &Arc<Self>, user_id: Uuid) {
        let hub = self.clone();
        let membership = self.collaborators.membership.clone();
        let task = async move {
            let rooms = membership.rooms_for_user(user_id).await;
            for room_id in rooms {
                hub.subscribe(user_id, room_id).await;
            }
        };

        if tokio::time::timeout(AUTO_SUBSCRIBE_TIMEOUT, task).await.is_err() {
            tracing::debug!(%user_id, "auto-subscribe exceeded 5s ceiling, continuing in background");
        }
    }

    /// Removes `user_id` from `clients` and every subscribed room, cancels
    /// its writer, and closes its queue (dropping `tx` does this). Idempotent.
    pub async fn remove_client(&self, user_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.clients.remove(&user_id) {
            for room_id in &entry.room_subs {
                if let Some(subs) = inner.rooms.get_mut(room_id) {
                    subs.remove(&user_id);
                    if subs.is_empty() {
                        inner.rooms.remove(room_id);
                    }
                }
            }
            entry.cancel.cancel();
        }
    }

    /// Returns `false` if no such live client exists. Otherwise idempotent.
    pub async fn subscribe(&self, user_id: Uuid, room_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.clients.contains_key(&user_id) {
            return false;
        }
        inner.clients.get_mut(&user_id).unwrap().room_subs.insert(room_id);
        inner.rooms.entry(room_id).or_default().insert(user_id);
        true
    }

    pub async fn unsubscribe(&self, user_id: Uuid, room_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(client) = inner.clients.get_mut(&user_id) {
            client.room_subs.remove(&room_id);
        }
        if let Some(subs) = inner.rooms.get_mut(&room_id) {
            subs.remove(&user_id);
            if subs.is_empty() {
                inner.rooms.remove(&room_id);
            }
        }
    }

    /// Called by the room service when membership changes outside of a
    /// stream connect/disconnect, so the hub updates subscriptions without
    /// re-querying the membership source.
    pub async fn notify_room_join(&self, user_id: Uuid, room_id: Uuid) {
        self.subscribe(user_id, room_id).await;
    }

    pub async fn notify_room_leave(&self, user_id: Uuid, room_id: Uuid) {
        self.unsubscribe(user_id, room_id).await;
    }

    /// Broadcast algorithm: snapshot the subscriber set under the lock,
    /// release it, then enqueue non-blockingly to each subscriber. Never
    /// blocks on a slow client.
    pub async fn broadcast_to_room(&self, room_id: Uuid, mut event: ServerEvent) {
        let subscribers: Vec<Uuid> = {
            let inner = self.inner.read().await;
            match inner.rooms.get(&room_id) {
                Some(subs) => subs.iter().copied().collect(),
                None => {
                    tracing::debug!(%room_id, "broadcast_to_room: no subscribers, dropping");
                    return;
                }
            }
        };
        if subscribers.is_empty() {
            tracing::debug!(%room_id, "broadcast_to_room: empty subscriber set, dropping");
            return;
        }

        event.stamp();
        for user_id in subscribers {
            self.enqueue(user_id, event.clone()).await;
        }
    }

    pub async fn broadcast_to_user(&self, user_id: Uuid, mut event: ServerEvent) {
        event.stamp();
        self.enqueue(user_id, event).await;
    }

    async fn enqueue(&self, user_id: Uuid, event: ServerEvent) {
        let tx = {
            let inner = self.inner.read().await;
            if inner.shutting_down {
                return;
            }
            match inner.clients.get(&user_id) {
                Some(client) => client.tx.clone(),
                None => return,
            }
        };

        match tx.try_send(event) {
            Ok(()) => {
                self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Full queue or closed receiver: drop-newest-for-recipient,
                // never block the broadcaster.
                self.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Rejects new clients and cancels/closes every existing one. Events
    /// arriving after this begins are dropped silently by `enqueue`.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        inner.shutting_down = true;
        for entry in inner.clients.values() {
            entry.cancel.cancel();
        }
        inner.clients.clear();
        inner.rooms.clear();
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn room_subscriber_count(&self, room_id: Uuid) -> usize {
        self.inner.read().await.rooms.get(&room_id).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn is_subscribed(&self, user_id: Uuid, room_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .clients
            .get(&user_id)
            .map(|c| c.room_subs.contains(&room_id))
            .unwrap_or(false)
    }
}

/// Drains one client's outbound queue onto its transport. A 30 s tick keeps
/// the writer responsive to cancellation even when idle, per §4.5. Any
/// write error terminates the writer and removes the client from the hub.
pub async fn run_client_writer(
    hub: Arc<EventHub>,
    user_id: Uuid,
    mut rx: mpsc::Receiver<ServerEvent>,
    cancel: CancellationToken,
    transport: Arc<dyn ClientTransport>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(%user_id, "client writer cancelled");
                return;
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        if let Err(e) = transport.send(event).await {
                            tracing::warn!(%user_id, error = %e, "client writer send failed, removing client");
                            hub.remove_client(user_id).await;
                            return;
                        }
                    }
                    None => {
                        // Queue closed: either remove_client already ran
                        // (last-writer-wins) or the hub shut down.
                        return;
                    }
                }
            }
            _ = ticker.tick() => {}
        }
    }
}
