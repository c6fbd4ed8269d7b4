//! Mapper service entry point.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mapsrv::drivers::default_driver_registry;
use mapsrv::panel::DevPanel;
use mapsrv::sink::{LogSink, Sink};
use mapsrv::source::{JsonProfileSource, Source};
use mapsrv::ServiceConfig;

/// Command-line arguments for mapsrv.
#[derive(Parser, Clone)]
#[command(
    name = "mapsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Edge device mapper - device twin synchronization service",
    long_about = None
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Path to the service configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Path to the device-profile JSON document; overrides the config file
    #[arg(short = 'p', long)]
    profile: Option<PathBuf>,

    /// Validation mode - only validate the profile without starting devices
    #[arg(long)]
    validate: bool,
}

fn init_logging(
    level: &str,
    dir: Option<&std::path::Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer().with_target(true);

    match dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mapsrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Ok(Some(guard))
        },
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            Ok(None)
        },
    }
}

fn build_sink(config: &ServiceConfig) -> Arc<dyn Sink> {
    #[cfg(feature = "mqtt")]
    if config.mqtt.enabled {
        info!(host = %config.mqtt.host, port = config.mqtt.port, "publishing to MQTT broker");
        return Arc::new(mapsrv::sink::MqttSink::new(
            &config.mqtt.client_id,
            &config.mqtt.host,
            config.mqtt.port,
        ));
    }
    #[cfg(not(feature = "mqtt"))]
    if config.mqtt.enabled {
        tracing::warn!("mqtt.enabled is set but the mqtt feature is compiled out; using log sink");
    }
    Arc::new(LogSink)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref())?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = init_logging(&level, config.logging.dir.as_deref())?;

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "starting mapper service"
    );

    let profile_path = args.profile.unwrap_or_else(|| config.profile.path.clone());
    let source = JsonProfileSource::new(&profile_path);

    if args.validate {
        let maps = source.load_profile().await?;
        info!(
            devices = maps.devices.len(),
            models = maps.models.len(),
            protocols = maps.protocols.len(),
            "profile valid"
        );
        return Ok(());
    }

    let drivers = Arc::new(default_driver_registry());
    let sink = build_sink(&config);
    let panel = Arc::new(DevPanel::new(drivers, sink, config.panel_settings()));

    panel.dev_init(&source).await?;
    panel.dev_start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    panel.shutdown().await;

    Ok(())
}
