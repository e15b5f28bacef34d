//! Fluxgate Panel
//!
//! Control-plane server for proxy nodes: agent WebSockets, report ingestion,
//! and background accounting and enforcement.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use fluxgate_core::config::{default_database_path, load_config};
use fluxgate_core::tracing_init::init_tracing;
use fluxgate_panel::Panel;
use fluxgate_panel::storage::PanelDatabase;

#[derive(Parser, Debug)]
#[command(name = "fluxgate-panel")]
#[command(version, about = "Fluxgate panel - proxy fleet control plane")]
struct Args {
    /// Settings file layered over the global settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "FLUXGATE_LISTEN_ADDR")]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JWT secret for observer tokens.
    #[arg(long, env = "FLUXGATE_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr.to_string();
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if let Some(secret) = args.jwt_secret {
        config.server.jwt_secret = secret;
    }
    config.server.log_json |= args.log_json;

    init_tracing(
        &format!("fluxgate_panel={}", config.server.log_level),
        config.server.log_json,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        "Starting fluxgate-panel"
    );

    let db_path = match config.server.database_path.clone() {
        Some(path) => path,
        None => default_database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?,
    };
    info!(path = %db_path.display(), "Opening panel database");
    let db = PanelDatabase::open(&db_path).await?;

    let stale = db.reset_node_status().await?;
    if stale > 0 {
        info!(nodes = stale, "Marked nodes offline from previous run");
    }

    let mut panel = Panel::new(db, &config);
    let tasks = panel.start();

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    let mut stop = panel.shutdown_signal();
    let mut server = tokio::spawn(
        axum::serve(listener, panel.router()).with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopping| *stopping).await;
        }).into_future(),
    );
    info!(addr = %config.server.listen_addr, "Panel listening");

    tokio::select! {
        result = &mut server => {
            warn!(?result, "HTTP server exited unexpectedly");
            panel.shutdown(tasks).await;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
        }
    }

    panel.shutdown(tasks).await;
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "HTTP server stopped with error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
