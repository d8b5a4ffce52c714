use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::room::RoomIndex;
use crate::session::SessionTable;
use crate::udp_wire::encode_media;

/// For every arriving MEDIA packet, writes it to every other session in the
/// sender's room. Never blocks: the underlying socket write is attempted
/// non-blockingly, and a full send buffer drops that one recipient's copy.
pub struct VoiceRouter {
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomIndex>,
    socket: Arc<UdpSocket>,
}

impl VoiceRouter {
    pub fn new(sessions: Arc<SessionTable>, rooms: Arc<RoomIndex>, socket: Arc<UdpSocket>) -> Self {
        Self { sessions, rooms, socket }
    }

    /// `ssrc_and_payload` is the MEDIA packet's body as received, i.e. the
    /// 4-byte SSRC prefix followed by the opaque payload — forwarded to
    /// every recipient unchanged except for the leading type tag.
    pub async fn route(&self, sender_session_id: u32, ssrc_and_payload: &[u8]) {
        let Some(sender) = self.sessions.get_by_id(sender_session_id).await else {
            tracing::debug!(session_id = sender_session_id, "route: unknown sender session, dropping");
            return;
        };

        sender.packets_received.fetch_add(1, Ordering::Relaxed);
        sender.bytes_received.fetch_add(ssrc_and_payload.len() as u64, Ordering::Relaxed);

        let members = self.rooms.members(sender.room_id).await;
        if members.is_empty() {
            tracing::debug!(room_id = %sender.room_id, "route: room has no members, dropping");
            return;
        }

        let out = encode_media(ssrc_and_payload);
        for recipient in members {
            if recipient.session_id == sender.session_id {
                continue;
            }
            match self.socket.try_send_to(&out, recipient.remote_addr()) {
                Ok(_) => {
                    recipient.packets_sent.fetch_add(1, Ordering::Relaxed);
                    recipient.bytes_sent.fetch_add(out.len() as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    recipient.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // A write error to one destination never blocks delivery
                    // to the others; just count it and move on.
                    recipient.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        recipient = recipient.session_id,
                        error = %e,
                        "route: send failed"
                    );
                }
            }
        }
    }
}
