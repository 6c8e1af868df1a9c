//! # OBD Collector
//!
//! Record OBD-II and GPS telemetry into trip files and sync them to object
//! storage.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Parse arguments and load the TOML configuration
//!    - Set up logging (console, plus daily files when `log_dir` is set)
//!    - Build the sync agent, adapter factory and positioning source
//!
//! 2. **Run**
//!    - Start the positioning reader and the first acquisition session
//!    - Serve the command protocol until Ctrl+C
//!
//! 3. **Graceful Shutdown**
//!    - Stop the session (trip file flushed and closed)
//!    - Stop the positioning reader and wait for running sync passes

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use obd_collector::catalog::Catalog;
use obd_collector::command::CommandServer;
use obd_collector::config::{Config, LoggingConfig};
use obd_collector::obd::elm327::Elm327Factory;
use obd_collector::orchestrator::Orchestrator;
use obd_collector::positioning::gpsd::GpsdSource;
use obd_collector::session::SessionSettings;
use obd_collector::sync::SyncAgent;

/// Log file name prefix inside `log_dir`
const LOG_FILE_PREFIX: &str = "obd-collector.log";

#[derive(Debug, Parser)]
#[command(name = "obd-collector", version, about = "Vehicle OBD telemetry collector")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/collector.toml")]
    config: PathBuf,
}

/// Console logging, plus a daily rolling file when configured
///
/// The returned guard must live until exit so buffered file lines are
/// flushed.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let _log_guard = init_logging(&config.logging);
    info!("OBD Collector v{} starting...", env!("CARGO_PKG_VERSION"));

    let (catalog, unknown) = Catalog::standard().narrowed(&config.catalog.parameters);
    for name in unknown {
        warn!("Unknown catalog parameter {} ignored", name);
    }
    info!("Catalog: {} parameters, {} statuses", catalog.parameters().len(), catalog.statuses().len());

    let sync = if config.storage.enabled {
        let agent = SyncAgent::from_config(&config).context("failed to set up trip sync")?;
        Some(Arc::new(agent))
    } else {
        None
    };

    let factory = Arc::new(Elm327Factory::new(config.device.clone()));
    let mut orchestrator = Orchestrator::new(SessionSettings::from_config(&config), catalog, factory, sync);

    if config.positioning.enabled {
        let source = GpsdSource::new(&config.positioning.gpsd_host, config.positioning.gpsd_port);
        orchestrator = orchestrator.with_positioning(
            Box::new(source),
            Duration::from_millis(config.positioning.fix_timeout_ms),
        );
    }

    let orchestrator = Arc::new(orchestrator);
    let trip_id = orchestrator.start().await;
    info!("First trip: {}", trip_id);

    let server = if config.server.enabled {
        let addr = format!("{}:{}", config.server.bind_address, config.server.port);
        let server = CommandServer::bind(&addr, &config.server.secret, orchestrator.clone())
            .await
            .with_context(|| format!("failed to bind command server on {}", addr))?;
        Some(server)
    } else {
        info!("Command server disabled");
        None
    };

    info!("Press Ctrl+C to exit");

    tokio::select! {
        _ = async {
            match server {
                Some(server) => server.run().await,
                None => std::future::pending::<()>().await,
            }
        } => {}

        // Handle Ctrl+C for graceful shutdown
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
        }
    }

    orchestrator.shutdown().await;
    info!("Goodbye");
    Ok(())
}
