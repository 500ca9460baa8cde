use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use garagewatch::api;
use garagewatch::config::Config;
use garagewatch::config::OperatingMode;
use garagewatch::SyncController;
use garagewatch::Transport;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Mirror garage door and alarm state from a remote service")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "garagewatch.toml")]
    config: PathBuf,

    /// Override the operating mode from the configuration file
    #[arg(long, value_enum)]
    mode: Option<OperatingMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(mode) = args.mode {
        config.sync.mode = mode;
        config.validate()?;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("garagewatch starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let transport = build_transport(&config).await?;
    let (controller, handle) = SyncController::new(transport, config.sync.settings());
    let controller_task = controller.spawn();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = if config.api.enabled {
        let listen = config.api.listen.clone();
        let port = config.api.port;
        let handle = handle.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(listen, port, handle, shutdown_rx).await {
                tracing::error!("HTTP API server failed: {:#}", e);
            }
        }))
    } else {
        tracing::info!("HTTP API disabled");
        None
    };

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    let _ = shutdown_tx.send(());
    if let Some(task) = api_task {
        let _ = task.await;
    }

    // Controller exits once the last handle is gone
    drop(handle);
    let _ = controller_task.await;

    tracing::info!("garagewatch shutdown complete");
    Ok(())
}

async fn build_transport(config: &Config) -> anyhow::Result<Transport> {
    match config.sync.mode {
        OperatingMode::Direct => build_direct(config),
        OperatingMode::Relayed => build_relayed(config).await,
    }
}

#[cfg(feature = "transport_rest")]
fn build_direct(config: &Config) -> anyhow::Result<Transport> {
    use garagewatch::remote::HassRestClient;

    let remote = config
        .remote
        .as_ref()
        .context("direct mode requires a [remote] section")?;
    tracing::info!("Using remote service at {}", remote.base_url);
    let client = HassRestClient::new(remote)?;
    Ok(Transport::Direct(Arc::new(client)))
}

#[cfg(not(feature = "transport_rest"))]
fn build_direct(_config: &Config) -> anyhow::Result<Transport> {
    anyhow::bail!("direct mode requires the transport_rest feature")
}

#[cfg(feature = "transport_mqtt")]
async fn build_relayed(config: &Config) -> anyhow::Result<Transport> {
    use garagewatch::relay::MqttRelay;
    use garagewatch::relay::RumqttcClient;

    let relay = config
        .relay
        .as_ref()
        .context("relayed mode requires a [relay] section")?;
    let client = RumqttcClient::new(relay)?;
    let channel = MqttRelay::start(client, relay).await?;
    Ok(Transport::Relayed(Arc::new(channel)))
}

#[cfg(not(feature = "transport_mqtt"))]
async fn build_relayed(_config: &Config) -> anyhow::Result<Transport> {
    anyhow::bail!("relayed mode requires the transport_mqtt feature")
}
