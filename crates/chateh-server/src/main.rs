//! Chat relay server entry point.
//!
//! Loads `config.ron` (creating it on first run), applies CLI overrides,
//! initializes logging and serves until SIGINT or SIGTERM.
//!
//! Run with: `cargo run -p chateh-server -- --bind 127.0.0.1:9494`

mod settings;

use std::sync::Arc;

use chateh_config::{CliArgs, Config};
use chateh_net::ChatServer;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().or_else(Config::default_dir);
    let mut config = match config_dir.as_deref() {
        Some(dir) => Config::load_or_create(dir)?,
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| config_dir.as_ref().map(|dir| dir.join("logs")));
    chateh_log::init_logging(log_dir.as_deref(), config.log.json_file, Some(&config));

    let server_config = settings::server_config(&config)?;
    info!(
        "Chat relay: bind={} max_sessions={} heartbeat={:?} queue={} echo={}",
        server_config.bind_addr,
        server_config.max_sessions,
        server_config.session.heartbeat.interval,
        server_config.broadcast.queue_capacity,
        server_config.broadcast.echo_to_sender,
    );

    let server = Arc::new(ChatServer::new(server_config));
    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_server.shutdown();
    });

    server.run().await?;

    let stats = server.stats();
    info!(
        "Relayed {} messages ({} deliveries, {} dropped, {} pruned)",
        stats.enqueued, stats.delivered, stats.dropped, stats.pruned
    );
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
