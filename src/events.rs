use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One domain event fanned out by the hub to every subscriber of a room (or
/// directly to one user). `event_id`/`created_at` are stamped by
/// `EventHub::broadcast_to_room`/`broadcast_to_user` if left unset by the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub payload: EventPayload,
}

impl ServerEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self { event_id: None, created_at: None, payload }
    }

    /// Fills in `event_id`/`created_at` if either is unset, per the
    /// broadcast algorithm's step 3.
    pub fn stamp(&mut self) {
        if self.event_id.is_none() {
            self.event_id = Some(Uuid::now_v7());
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
    }
}

/// The tagged union of domain events the control plane emits over the
/// stream endpoint. Each variant mirrors one RPC-boundary notification from
/// the surrounding (out-of-scope) service layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    MessageCreated { room_id: Uuid, message_id: Uuid, author_id: Uuid, content: String },
    MessageEdited { room_id: Uuid, message_id: Uuid, content: String },
    MessageDeleted { room_id: Uuid, message_id: Uuid },
    MessageReactionAdded { room_id: Uuid, message_id: Uuid, user_id: Uuid, emoji: String },
    MessageReactionRemoved { room_id: Uuid, message_id: Uuid, user_id: Uuid, emoji: String },
    MessagePinned { room_id: Uuid, message_id: Uuid },
    MessageUnpinned { room_id: Uuid, message_id: Uuid },
    VoiceUserJoined { room_id: Uuid, user_id: Uuid },
    VoiceUserLeft { room_id: Uuid, user_id: Uuid },
    UserStatusChanged { user_id: Uuid, online: bool },
    DmCallStarted { room_id: Uuid, initiator_id: Uuid },
    DmCallEnded { room_id: Uuid },
    PresenceUpdated { user_id: Uuid, online: bool },
}

/// The only message a client sends back over the stream with defined
/// semantics: an `Ack` that refreshes presence heartbeat. Other variants are
/// reserved for the out-of-scope RPC surface and are decoded but otherwise
/// ignored by the stream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    Ack { event_id: Uuid },
    #[serde(other)]
    Unknown,
}
