use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use morphus::application::services::DEFAULT_CHANNEL_CAPACITY;
use morphus::application::{OriginFetcher, ServeImageUseCase, ServeSettings, TransformPipeline};
use morphus::domain::entities::DescriptorRules;
use morphus::domain::services::CapabilityNegotiator;
use morphus::infrastructure::{
    AppConfig, CliArgs, ConfigLoader, HttpUpstream, ImageRsEngine, build_storage, load_capabilities,
};
use morphus::presentation::{ServerState, start_server};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

async fn create_state(config: &AppConfig) -> Result<ServerState> {
    let storage = build_storage(&config.storage)?;
    storage.init().await?;

    let upstream = Arc::new(HttpUpstream::new(
        Duration::from_secs(config.upstream.timeout_secs),
        config.upstream.max_body_bytes,
    )?);
    let matrix = load_capabilities(&config.capabilities)?;

    let settings = ServeSettings {
        rules: DescriptorRules {
            presets: config.presets.clone(),
            only_allow_presets: config.only_allow_presets,
            clean_urls: config.clean_urls,
            negotiator: CapabilityNegotiator::new(matrix.map(Arc::new)),
        },
        policy: config.access_policy()?,
        max_age: config.max_age_duration()?,
        channel_capacity: DEFAULT_CHANNEL_CAPACITY,
    };

    let origin = Arc::new(OriginFetcher::new(storage.clone(), upstream));
    let pipeline = Arc::new(TransformPipeline::new(Arc::new(ImageRsEngine::new())));
    let use_case = ServeImageUseCase::new(settings, storage, origin, pipeline);

    Ok(ServerState::new(Arc::new(use_case)))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let config = ConfigLoader::new().load(CliArgs::parse())?;
    init_logging(&config)?;

    info!(
        version = morphus::VERSION,
        storage = config.storage.kind(),
        "Starting morphus"
    );

    let state = create_state(&config).await?;
    start_server(config.socket_addr(), state, config.shutdown_grace()).await?;

    info!("Stopped");
    Ok(())
}
