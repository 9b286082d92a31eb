//! Server bootstrap: configuration in, a listening hub out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::db::SqliteBacklog;
use crate::hub::Hub;
use crate::offline::{BacklogStore, MemoryBacklog};
use crate::web;

pub struct NotifyServer {
    config: ServerConfig,
}

impl NotifyServer {
    pub fn new(config: ServerConfig) -> Self {
        NotifyServer { config }
    }

    fn build_store(&self) -> Result<Arc<dyn BacklogStore>> {
        match self.config.db_path.as_deref() {
            Some(path) => {
                let store = SqliteBacklog::open(path)
                    .with_context(|| format!("opening backlog database {path}"))?;
                tracing::info!(path, "Backlog store: sqlite");
                Ok(Arc::new(store))
            }
            None => {
                tracing::info!("Backlog store: in-memory");
                Ok(Arc::new(MemoryBacklog::new()))
            }
        }
    }

    /// Start the server and return the bound address, the hub, and the
    /// serve task (for testing and embedding). The serve task ends once
    /// the hub shuts down.
    pub async fn start(self) -> Result<(SocketAddr, Arc<Hub>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let store = self.build_store()?;
        let hub = Hub::start(self.config.hub_config(), store);
        let app = web::router(hub.clone());

        let mut shutdown = hub.shutdown_signal();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stopped| *stopped).await;
                })
                .await?;
            Ok(())
        });
        Ok((addr, hub, handle))
    }

    /// Run until ctrl-c, then shut the hub down and drain the listener.
    pub async fn run(self) -> Result<()> {
        let (_addr, hub, server) = self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .context("listening for ctrl-c")?;
        tracing::info!("Received ctrl-c, shutting down");
        hub.shutdown().await;
        server.await??;
        Ok(())
    }
}
