//! Davra device agent.
//!
//! Reads `config.json` (path from `DAVRA_CONFIG`), connects to the configured
//! brokers and runs the agent service until Ctrl-C.
//!
//! # Environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DAVRA_CONFIG` | `/usr/bin/davra/config.json` |
//! | `DAVRA_INSTALL_DIR` | `installationDir` from the config, else `/usr/bin/davra` |
//! | `RUST_LOG` | `info,davra_agent=debug` |

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use davra_agent::{
    intent, router, AgentHandle, AgentService, AgentSettings, Bus, ServiceParts, SystemMetrics,
    TICK_PERIOD,
};
use davra_api::HttpServerApi;
use davra_bus::{cloud, local, AgentPublisher, ChannelOptions, MqttChannel};
use davra_core::{SystemClock, AGENT_VERSION};
use davra_store::{ConfigStore, FileStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,davra_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("DAVRA_CONFIG")
        .unwrap_or_else(|_| format!("{}/config.json", AgentSettings::DEFAULT_INSTALLATION_DIR));
    tracing::info!(path = %config_path, version = AGENT_VERSION, "Loading configuration");

    let config = Arc::new(ConfigStore::open(&config_path)?);
    let mut settings = AgentSettings::from_map(&config.snapshot())?;
    if let Ok(dir) = std::env::var("DAVRA_INSTALL_DIR") {
        settings = settings.with_installation_dir(dir);
    }
    tracing::info!(
        device_id = %settings.device_id,
        installation_dir = %settings.installation_dir.display(),
        heartbeat_interval_secs = settings.heartbeat_interval_secs,
        script_max_time_secs = settings.script_max_time_secs,
        "Configuration loaded"
    );

    let store = Arc::new(FileStore::open(&settings.installation_dir)?);
    let api = Arc::new(HttpServerApi::new(settings.api_config())?);
    let (handle, intents) = AgentHandle::channel(intent::DEFAULT_CAPACITY);

    // Local bus: the agent both publishes and subscribes.
    let local_channel = settings.local_broker_address().map(|broker| {
        let options = ChannelOptions::new(settings.local_client_id(), broker, local::TOPIC)
            .with_credentials(settings.device_id.as_str(), settings.api_token.as_str());
        let (channel, payloads) = MqttChannel::connect(options);
        router::spawn(Bus::Local, payloads, handle.clone());
        channel
    });
    let publisher = match &local_channel {
        Some(channel) => AgentPublisher::new(Arc::new(channel.clone()), AGENT_VERSION),
        None => {
            tracing::warn!("No local broker configured, device applications cannot reach the agent");
            AgentPublisher::disconnected(AGENT_VERSION)
        }
    };

    // Cloud bus: subscribe only, the poll stays authoritative.
    let cloud_channel = match settings.cloud_broker_address() {
        Some(broker) if !settings.api_token.is_empty() => {
            let options =
                ChannelOptions::new(
                settings.cloud_client_id(),
                broker,
                cloud::topic(&settings.device_id),
            )
                    .with_credentials(settings.device_id.as_str(), settings.api_token.as_str());
            let (channel, payloads) = MqttChannel::connect(options);
            router::spawn(Bus::Cloud, payloads, handle.clone());
            Some(channel)
        }
        _ => {
            tracing::warn!("No cloud broker configured, relying on the job poll");
            None
        }
    };

    let mut service = AgentService::new(
        ServiceParts {
            settings,
            config,
            store,
            api,
            local: publisher,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(SystemMetrics::new()),
            http: reqwest::Client::new(),
        },
        handle.clone(),
    );
    service.startup().await?;

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown.shutdown().await;
        }
    });
    drop(handle);

    service.run(intents, TICK_PERIOD).await;

    for channel in local_channel.iter().chain(cloud_channel.iter()) {
        channel.disconnect();
    }
    Ok(())
}
