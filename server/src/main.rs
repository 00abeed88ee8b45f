mod config;
mod hub;
mod session;

use alarm_stream_shared::defaults;
use clap::Parser;
use config::HubConfig;
use hub::Hub;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Push alarm JSON lines from stdin to every subscriber
#[derive(Debug, Parser)]
#[command(name = "alarm-hub", version)]
struct Args {
    #[arg(long, env = "ALARM_HUB_BIND", default_value = "0.0.0.0:18080")]
    bind: String,

    #[arg(long, env = "ALARM_HUB_PATH", default_value = defaults::ALARM_CHANNEL_PATH)]
    path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let hub = Hub::new(HubConfig {
        bind: args.bind,
        path: args.path,
    });
    let listener = hub.bind().await?;

    let sessions = hub.sessions();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match hub::feed_lines(stdin, &sessions).await {
            Ok(sent) => info!("[HUB] Input closed after {} alarms", sent),
            Err(e) => warn!("[HUB] Input failed: {}", e),
        }
    });

    tokio::select! {
        result = hub.serve(listener) => {
            if let Err(e) = &result {
                error!("[HUB] Listener failed: {}", e);
            }
            result
        }
        result = tokio::signal::ctrl_c() => {
            info!("[HUB] Shutting down");
            result.map_err(Into::into)
        }
    }
}
