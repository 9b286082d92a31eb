use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use byline_notify::config::ServerConfig;
use byline_notify::server::NotifyServer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    // JSON logs for production collectors, human-readable otherwise
    let filter = EnvFilter::from_default_env().add_directive("byline_notify=info".parse()?);
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting notification server on {}", config.listen_addr);
    match config.db_path {
        Some(ref path) => tracing::info!("Persistent backlog at {path}"),
        None => tracing::info!("In-memory backlog, notifications do not survive restarts"),
    }

    let server = NotifyServer::new(config);
    server.run().await
}
