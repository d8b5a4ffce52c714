use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use concord::config::AppConfig;
use concord::error::{AppError, AppResult};
use concord::events::{EventPayload, ServerEvent};
use concord::hub::EventHub;
use concord::membership::Collaborators;
use concord::registry::{Assignment, HeartbeatStats, VoiceAssigner, VoiceRegistry};
use concord::stream::{handle_stream, StreamState};
use concord::token::VoiceTokenCodec;

#[derive(Clone)]
struct AppState {
    hub: Arc<EventHub>,
    collaborators: Arc<Collaborators>,
    registry: Arc<VoiceRegistry>,
    assigner: Arc<VoiceAssigner>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config);

    tracing::info!("Starting Concord control-plane v{}", env!("CARGO_PKG_VERSION"));

    let collaborators = Arc::new(Collaborators::in_memory());
    let hub = Arc::new(EventHub::new(collaborators.clone()));
    let registry = Arc::new(VoiceRegistry::new(Duration::from_secs(config.registry.heartbeat_interval_secs)));
    let tokens = Arc::new(VoiceTokenCodec::new(
        config.auth.voice_secret.clone(),
        config.auth.voice_secret_previous.clone(),
        config.auth.token_expiry_secs,
    ));
    let assigner = Arc::new(VoiceAssigner::new(registry.clone(), tokens));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let sweeper = tokio::spawn(
        registry
            .clone()
            .run_sweeper(Duration::from_secs(config.registry.heartbeat_interval_secs), shutdown_tx.subscribe()),
    );

    let state = AppState { hub: hub.clone(), collaborators, registry, assigner };
    let app = build_router(state);

    let addr = format!("{}:{}", config.control.host, config.control.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("control-plane listening on {}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(());
    hub.shutdown().await;
    sweeper.abort();
    tracing::info!("Concord control-plane stopped gracefully");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => fmt().with_env_filter(filter).json().init(),
        _ => fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/stream", get(stream_handler))
        .route("/v1/voice-servers", post(register_voice_server))
        .route("/v1/voice-servers/:server_id/heartbeat", post(voice_server_heartbeat))
        .route("/v1/voice-servers", get(list_voice_servers))
        .route("/v1/calls/start", post(start_call))
        .route("/v1/rooms/:room_id/events", post(publish_room_event))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    ws: axum::extract::WebSocketUpgrade,
) -> axum::response::Response {
    let stream_state = StreamState { hub: state.hub.clone(), collaborators: state.collaborators.clone() };
    handle_stream(State(stream_state), headers, ws).await
}

#[derive(Deserialize)]
struct RegisterServerBody {
    server_id: String,
    region: String,
    addr_udp: String,
    addr_ctrl: String,
    capacity_hint: u32,
}

async fn register_voice_server(State(state): State<AppState>, Json(body): Json<RegisterServerBody>) -> AppResult<()> {
    state
        .registry
        .upsert(body.server_id, body.region, body.addr_udp, body.addr_ctrl, body.capacity_hint)
        .await;
    Ok(())
}

#[derive(Deserialize)]
struct HeartbeatBody {
    active_rooms: u32,
    active_sessions: u32,
    cpu_fraction: f64,
    outbound_mbps: f64,
}

async fn voice_server_heartbeat(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> AppResult<()> {
    state
        .registry
        .heartbeat(
            &server_id,
            HeartbeatStats {
                active_rooms: body.active_rooms,
                active_sessions: body.active_sessions,
                cpu_fraction: body.cpu_fraction,
                outbound_mbps: body.outbound_mbps,
            },
        )
        .await
}

async fn list_voice_servers(State(state): State<AppState>) -> Json<Vec<concord::registry::VoiceServer>> {
    Json(state.registry.list(None).await)
}

#[derive(Deserialize)]
struct StartCallBody {
    room_id: Uuid,
    user_id: Uuid,
    #[serde(default)]
    audio_only: bool,
    #[serde(default)]
    region_hint: Option<String>,
}

async fn start_call(State(state): State<AppState>, Json(body): Json<StartCallBody>) -> AppResult<Json<Assignment>> {
    let assignment = state
        .assigner
        .assign(body.room_id, body.user_id, body.audio_only, body.region_hint.as_deref())
        .await?;
    Ok(Json(assignment))
}

#[derive(Deserialize)]
struct PublishEventBody {
    room_id: Uuid,
    payload: EventPayload,
}

async fn publish_room_event(State(state): State<AppState>, Json(body): Json<PublishEventBody>) -> AppResult<()> {
    if body.room_id.is_nil() {
        return Err(AppError::BadRequest("room_id must not be nil".into()));
    }
    state.hub.broadcast_to_room(body.room_id, ServerEvent::new(body.payload)).await;
    Ok(())
}
