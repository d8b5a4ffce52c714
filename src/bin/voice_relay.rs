use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing_subscriber::{fmt, EnvFilter};

use concord::config::AppConfig;
use concord::registrar::{HttpRegistryClient, LocalStatsSource, VoiceRegistrar};
use concord::room::RoomIndex;
use concord::session::SessionTable;
use concord::token::VoiceTokenCodec;
use concord::voice_udp::VoiceUdpServer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config);

    tracing::info!("Starting Concord voice-relay v{}", env!("CARGO_PKG_VERSION"));

    let sessions = Arc::new(SessionTable::new());
    let rooms = Arc::new(RoomIndex::new());
    let tokens = Arc::new(VoiceTokenCodec::new(
        config.auth.voice_secret.clone(),
        config.auth.voice_secret_previous.clone(),
        config.auth.token_expiry_secs,
    ));

    let bind_addr = format!("{}:{}", config.voice.bind_host, config.voice.bind_port);
    let socket = Arc::new(UdpSocket::bind(&bind_addr).await?);
    tracing::info!("voice-relay UDP socket bound on {}", bind_addr);

    let udp_server = Arc::new(VoiceUdpServer::new(
        socket,
        sessions.clone(),
        rooms.clone(),
        tokens,
        Duration::from_secs(config.voice.session_timeout_secs),
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let recv_task = tokio::spawn(udp_server.clone().run(shutdown_tx.subscribe()));
    let cleanup_task = tokio::spawn(
        udp_server
            .clone()
            .run_cleanup_loop(Duration::from_secs(config.voice.cleanup_interval_secs), shutdown_tx.subscribe()),
    );

    let public_host = config.node.public_host.clone().unwrap_or(config.voice.bind_host.clone());
    let registrar = VoiceRegistrar::new(
        Arc::new(HttpRegistryClient::new(config.registry.url.clone())),
        Arc::new(LocalStatsSource::new(sessions, rooms)),
        config.node.server_id.clone(),
        config.node.region.clone(),
        format!("{public_host}:{}", config.voice.bind_port),
        format!("{}:{}", config.control.host, config.control.port),
        10_000,
    );

    if let Err(e) = registrar.register().await {
        tracing::error!(error = %e, "initial registration with control plane failed, will retry via heartbeat");
    }
    let heartbeat_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        let interval = Duration::from_secs(config.registry.heartbeat_interval_secs);
        async move { registrar.run_heartbeat_loop(interval, shutdown_rx).await }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, tearing down voice-relay");
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = recv_task.await;
        let _ = cleanup_task.await;
        let _ = heartbeat_task.await;
    })
    .await;

    tracing::info!("Concord voice-relay stopped gracefully");
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
}
