//! UDPST panel - web control panel for the OB-UDPST measurement binary

mod command;
mod config;
mod diagnostics;
mod handlers;
mod orchestrator;
mod output;
mod probe;
mod process;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use diagnostics::Diagnostics;
use handlers::AppState;
use orchestrator::Orchestrator;
use probe::Prober;
use std::sync::Arc;
use storage::Database;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "UDPST panel - drive OB-UDPST capacity tests over HTTP", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.conf")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::Config::load(&args.config).context("Failed to load configuration")?;

    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Starting UDPST panel v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", args.config);
    info!("Machine id: {}", config.general.machine_id);

    let db = Database::new(&config.general.database_path).with_context(|| {
        format!("Failed to open database: {}", config.general.database_path)
    })?;
    db.initialize().await.context("Failed to initialize database")?;
    let db = Arc::new(db);

    let orchestrator = Arc::new(Orchestrator::new(
        db,
        config.binary.clone(),
        config.general.machine_id.clone(),
    ));

    let binary = orchestrator.check_binary().await;
    if binary.available {
        info!("UDPST binary: {}", binary.path);
    } else {
        warn!(
            "UDPST binary not usable at {}: {}",
            binary.path,
            binary.error.as_deref().unwrap_or("unknown reason")
        );
    }

    let state = Arc::new(AppState {
        orchestrator,
        prober: Prober::new(config.probe.clone(), config.binary.clone()),
        diagnostics: Diagnostics::new(config.binary.clone()),
    });
    let app = handlers::router(state);

    let bind_addr = format!("{}:{}", config.general.bind_address, config.general.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("API listening on http://{}/api", bind_addr);
    info!(
        "Max concurrent tests: {}, watchdog grace: {}s",
        config.binary.max_concurrent_tests, config.binary.watchdog_grace_sec
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
