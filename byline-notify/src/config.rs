//! Command-line and environment configuration.

use std::time::Duration;

use clap::Parser;

use crate::hub::HubConfig;

/// Real-time notification delivery server for the Byline publishing
/// platform.
#[derive(Parser, Debug, Clone)]
#[command(name = "byline-notify", version, about)]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "BYLINE_NOTIFY_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path for the offline backlog. In-memory when unset.
    #[arg(long, env = "BYLINE_NOTIFY_DB")]
    pub db_path: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Outbound queue depth per connection.
    #[arg(long, default_value_t = 256)]
    pub outbound_queue: usize,

    /// Broadcast flush window in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub dispatch_window_ms: u64,

    /// Broadcast batch size that triggers an early flush.
    #[arg(long, default_value_t = 10)]
    pub dispatch_threshold: usize,

    /// Backlog entries kept per user.
    #[arg(long, default_value_t = 100)]
    pub backlog_cap: usize,

    /// Backlog retention in seconds.
    #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
    pub backlog_ttl_secs: u64,

    /// Seconds of inactivity before a connection is evicted.
    #[arg(long, default_value_t = 300)]
    pub max_idle_secs: u64,

    /// Seconds between inactivity sweeps.
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Seconds between liveness pings on idle sockets.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds shutdown waits for writers to drain.
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_queue: self.outbound_queue,
            dispatch_window: Duration::from_millis(self.dispatch_window_ms),
            dispatch_threshold: self.dispatch_threshold,
            backlog_cap: self.backlog_cap,
            backlog_ttl: Duration::from_secs(self.backlog_ttl_secs),
            max_idle: Duration::from_secs(self.max_idle_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ..HubConfig::default()
        }
    }
}
