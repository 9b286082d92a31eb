//! Real-time notification delivery for the Byline publishing platform.
//!
//! Readers subscribe over a WebSocket and receive JSON-framed
//! notifications as they are published. The [`hub::Hub`] is the
//! entry point: it owns a registry of live connections (one per user,
//! new logins displace old ones), a batching dispatcher for broadcast
//! traffic, and a per-user offline backlog that is replayed when a
//! user reconnects. Background loops ping idle sockets and evict dead
//! ones; shutdown closes everything with a bounded drain.
//!
//! Delivery is at-least-once for unicast (live send with a backlog
//! fallback) and best-effort for broadcast fan-out.

pub mod config;
pub mod connection;
pub mod db;
pub mod dispatch;
pub mod envelope;
pub mod hub;
pub mod offline;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod stats;
pub mod types;
pub mod web;

pub use connection::{Connection, SendError};
pub use envelope::{Envelope, FrameKind};
pub use hub::{Hub, HubConfig};
pub use registry::ConnectError;
pub use stats::StatsSnapshot;
pub use types::{Notification, UserId};
