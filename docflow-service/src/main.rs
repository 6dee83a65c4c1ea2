use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use docflow_service::auto_import;
use docflow_service::config::load_config;
use docflow_service::{ConverterRegistry, Scheduler, SqliteTaskArchive, TaskArchive};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting docflow service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        workers = config.scheduler.worker_count,
        queue_capacity = config.scheduler.queue_capacity,
        persistence = config.persistence.enabled,
        "Configuration loaded"
    );

    if let Some(addr) = &config.metrics.listen_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }

    let scheduler = Scheduler::start(config.scheduler.clone(), ConverterRegistry::with_builtin());

    if config.persistence.enabled {
        let archive: Arc<dyn TaskArchive> =
            Arc::new(SqliteTaskArchive::open(&config.persistence.database_path)?);
        info!(path = %config.persistence.database_path.display(), "Task archive opened");
        scheduler.spawn_status_flusher(archive, config.persistence.status_flush_interval());
    }

    scheduler.spawn_maintenance(&config.maintenance);

    // Runs until the scheduler stops
    if let Some(auto_import_dir) = &config.storage.auto_import_dir {
        auto_import::start_auto_import_worker(
            scheduler.clone(),
            auto_import_dir.clone(),
            config.storage.poll_interval(),
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    scheduler.stop().await;
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docflow_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
