use anyhow::Result;
use serde::Deserialize;

/// Configuration shared by both binaries, drawn from environment variables
/// with fallbacks, as prescribed by the "Process environment" contract.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub control: ControlConfig,
    pub voice: VoiceConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Stable identifier for this voice node, used in registry records and
    /// voice token claims. Defaults to a random UUID if unset.
    pub server_id: String,
    /// Region hint used by the assigner's region-pinned placement.
    pub region: String,
    /// Hostname/IP clients should dial for UDP voice traffic, if different
    /// from `voice.bind_host` (e.g. behind NAT or a load balancer).
    pub public_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    pub bind_host: String,
    pub bind_port: u16,
    /// Seconds of inactivity before a session is evicted by the cleanup sweep.
    pub session_timeout_secs: u64,
    /// Cadence of the relay's periodic cleanup sweep.
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Current HMAC secret used to sign/verify voice tokens.
    pub voice_secret: String,
    /// Previous secret still accepted during a rotation's grace window.
    pub voice_secret_previous: Option<String>,
    pub token_expiry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the control plane's registry endpoint, as seen by a
    /// voice node's registrar.
    pub url: String,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AppConfig {
    /// Load configuration from environment variables under the `CONCORD__`
    /// prefix (double underscore separates nested keys, e.g.
    /// `CONCORD__VOICE__BIND_PORT`), layered over built-in defaults.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("node.server_id", uuid::Uuid::now_v7().to_string())?
            .set_default("node.region", "default")?
            .set_default("node.public_host", None::<String>)?
            .set_default("control.host", "0.0.0.0")?
            .set_default("control.port", 8080)?
            .set_default("voice.bind_host", "0.0.0.0")?
            .set_default("voice.bind_port", 5000)?
            .set_default("voice.session_timeout_secs", 120)?
            .set_default("voice.cleanup_interval_secs", 30)?
            .set_default("auth.voice_secret", "dev-secret-change-me")?
            .set_default("auth.voice_secret_previous", None::<String>)?
            .set_default("auth.token_expiry_secs", 3600)?
            .set_default("registry.url", "http://127.0.0.1:8080")?
            .set_default("registry.heartbeat_interval_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "plain")?
            .add_source(
                config::Environment::with_prefix("CONCORD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = builder.try_deserialize()?;
        Ok(config)
    }
}
