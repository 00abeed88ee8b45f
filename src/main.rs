use std::time::Duration;

use alarm_stream::{
    defaults, ConnectionManager, ConnectionState, EndpointConfig, ReconnectPolicy, StreamConfig,
    StreamHooks,
};
use anyhow::anyhow;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Subscribe to the alarm push channel and log every event
#[derive(Debug, Parser)]
#[command(name = "alarm-stream", version)]
struct Args {
    /// Full channel URL; overrides host, secure and path
    #[arg(long, env = "ALARM_STREAM_URL")]
    url: Option<String>,

    /// http(s) origin of the web console, e.g. https://vmp.example.com:8443;
    /// overrides host and secure
    #[arg(long, env = "ALARM_STREAM_ORIGIN")]
    origin: Option<String>,

    /// host[:port] used to derive the URL
    #[arg(long, env = "ALARM_STREAM_HOST", default_value = defaults::DEFAULT_HOST)]
    host: String,

    /// Use wss instead of ws
    #[arg(long, env = "ALARM_STREAM_SECURE")]
    secure: bool,

    #[arg(long, env = "ALARM_STREAM_PATH", default_value = defaults::ALARM_CHANNEL_PATH)]
    path: String,

    /// Base reconnect delay; the n-th retry waits n times this
    #[arg(long, env = "ALARM_STREAM_BASE_DELAY_MS", default_value_t = defaults::RECONNECT_BASE_DELAY_MS)]
    base_delay_ms: u64,

    #[arg(long, env = "ALARM_STREAM_MAX_ATTEMPTS", default_value_t = defaults::RECONNECT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, env = "ALARM_STREAM_CONNECT_TIMEOUT_MS", default_value_t = defaults::CONNECT_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    /// Grace period for closing the channel before it is torn down
    #[arg(long, env = "ALARM_STREAM_CLOSE_TIMEOUT_MS", default_value_t = defaults::CLOSE_TIMEOUT_MS)]
    close_timeout_ms: u64,

    #[arg(long, env = "ALARM_STREAM_MAX_FRAME_BYTES", default_value_t = defaults::MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

impl Args {
    fn endpoint(&self) -> anyhow::Result<EndpointConfig> {
        let Some(origin) = &self.origin else {
            return Ok(EndpointConfig {
                secure: self.secure,
                host: self.host.clone(),
                path: self.path.clone(),
            });
        };

        let endpoint = EndpointConfig::from_origin(origin)
            .ok_or_else(|| anyhow!("origin must look like http(s)://host[:port], got {}", origin))?;
        Ok(EndpointConfig {
            path: self.path.clone(),
            ..endpoint
        })
    }

    fn stream_config(&self) -> anyhow::Result<StreamConfig> {
        Ok(StreamConfig {
            endpoint: self.endpoint()?,
            policy: ReconnectPolicy::new(
                Duration::from_millis(self.base_delay_ms),
                self.max_attempts,
            ),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = args.stream_config()?;
    let close_timeout = config.close_timeout;

    info!(
        "Alarm stream starting: {}",
        args.url.clone().unwrap_or_else(|| config.endpoint.url())
    );
    info!(
        "  reconnect: {} attempts, {}ms base delay (worst case {:?})",
        config.policy.max_attempts,
        config.policy.base_delay.as_millis(),
        config.policy.worst_case_total()
    );

    let hooks = StreamHooks::new()
        .on_open(|url| info!("[MAIN] Subscribed to {}", url))
        .on_close(|reason| warn!("[MAIN] Channel closed: {}", reason))
        .on_error(|e| error!("[MAIN] {}", e));
    let manager = ConnectionManager::websocket(config, hooks);

    manager.register(|event: &Value| {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("event");
        info!("[ALARM] {}: {}", kind, event);
    });

    manager.connect(args.url.as_deref());

    let mut state = manager.watch_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, disconnecting");
        }
        _ = state.wait_for(|s| *s == ConnectionState::Stopped) => {
            error!("Alarm stream stopped after {} failed attempts", manager.attempts());
        }
    }

    manager.disconnect();
    let _ = tokio::time::timeout(
        close_timeout,
        state.wait_for(|s| *s == ConnectionState::Stopped),
    )
    .await;

    Ok(())
}
