use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::{ClientEvent, ServerEvent};
use crate::hub::{run_client_writer, ClientTransport, EventHub};
use crate::membership::Collaborators;

const PRESENCE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state the `EventStream` axum handler needs: the hub it attaches
/// connections to and the collaborators it reports presence through.
#[derive(Clone)]
pub struct StreamState {
    pub hub: Arc<EventHub>,
    pub collaborators: Arc<Collaborators>,
}

/// Adapts axum's split WebSocket sink to the hub's `ClientTransport`. The
/// hub never knows it's talking to a WebSocket; this is the only file that
/// does.
struct WebSocketTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    async fn send(&self, event: ServerEvent) -> anyhow::Result<()> {
        let text = serde_json::to_string(&event)?;
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }
}

/// Extracts `user_id` from a trusted upstream header. In a full deployment
/// this is populated by an API gateway that already validated the user's
/// session token; that validation is out of core scope here (see
/// `MembershipSource`/`PresenceSink`).
fn authenticate(headers: &HeaderMap) -> Option<Uuid> {
    headers.get("x-concord-user-id")?.to_str().ok()?.parse().ok()
}

/// `GET /v1/stream` — upgrades to a WebSocket and hands the connection to
/// `run_stream`. Standing in for the §6 `EventStream` RPC boundary.
pub async fn handle_stream(
    State(state): State<StreamState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = authenticate(&headers) else {
        return axum::response::IntoResponse::into_response(axum::http::StatusCode::UNAUTHORIZED);
    };
    ws.on_upgrade(move |socket| run_stream(socket, state, user_id))
}

/// Owns the bidirectional transport for one connection: attaches it to the
/// hub, spawns its writer, loops on receive until disconnect, then tears
/// down. See §4.6.
async fn run_stream(socket: WebSocket, state: StreamState, user_id: Uuid) {
    let Some(handle) = state.hub.add_client(user_id).await else {
        tracing::warn!(%user_id, "stream: hub is shutting down, rejecting connection");
        return;
    };

    let (sink, mut receive) = socket.split();
    let transport = Arc::new(WebSocketTransport { sink: Mutex::new(sink) });

    let writer = tokio::spawn(run_client_writer(
        state.hub.clone(),
        user_id,
        handle.rx,
        handle.cancel.clone(),
        transport,
    ));

    let mut superseded = false;
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                tracing::debug!(%user_id, "stream: cancelled, superseded by a newer connection");
                superseded = true;
                break;
            }
            message = receive.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, user_id, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(%user_id, "stream: transport closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%user_id, error = %e, "stream: receive error");
                        break;
                    }
                }
            }
        }
    }

    // A cancellation means the hub already installed a replacement client
    // under this user_id (last-writer-wins) and did its own bookkeeping;
    // calling remove_client here would delete the *new* entry instead of
    // this superseded one, since both share the same key.
    if !superseded {
        state.hub.remove_client(user_id).await;
        mark_offline_bounded(&state, user_id).await;
    }
    writer.abort();
}

/// Decodes one inbound `ClientEvent`. Only `Ack` has defined semantics;
/// everything else is logged and otherwise ignored, per §6.
async fn handle_client_message(state: &StreamState, user_id: Uuid, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::Ack { event_id }) => {
            tracing::trace!(%user_id, %event_id, "stream: ack received, refreshing presence");
            state.collaborators.presence.mark_online(user_id).await;
        }
        Ok(ClientEvent::Unknown) => {
            tracing::debug!(%user_id, "stream: received client event with no defined semantics");
        }
        Err(e) => {
            tracing::debug!(%user_id, error = %e, "stream: malformed client event, ignoring");
        }
    }
}

/// Marks the user offline with its own 5s cleanup context, independent of
/// the (already-cancelled) transport context, per §5.
async fn mark_offline_bounded(state: &StreamState, user_id: Uuid) {
    let presence = state.collaborators.presence.clone();
    let result = tokio::time::timeout(PRESENCE_CLEANUP_TIMEOUT, async move {
        presence.mark_offline(user_id).await;
    })
    .await;
    if result.is_err() {
        tracing::warn!(%user_id, "stream: presence offline-marking exceeded its 5s cleanup window");
    }
}
