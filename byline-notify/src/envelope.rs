//! Wire format for frames pushed to subscribers.
//!
//! Every frame is a JSON text message:
//!
//! ```json
//! {"type":"notification","data":{"kind":"comment_reply","post":88},"timestamp":1756075845123,"message_id":"0198f0c2a11d4b20c1d2e3f4a5b6"}
//! {"type":"ping","data":null,"timestamp":1756075845123}
//! ```
//!
//! `type` separates application notifications from liveness probes.
//! `data` is opaque to the hub. `message_id` is omitted on the wire when
//! absent. Backlog entries persist the whole envelope, so a replayed
//! notification keeps its original timestamp and id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame discriminator carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Notification,
    Ping,
    Pong,
}

/// A single wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub data: Value,
    /// Unix milliseconds at envelope creation.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    /// Wrap a notification body. Stamps the current time and, when the
    /// caller did not supply one, a generated message id.
    pub fn notification(data: Value, message_id: Option<String>) -> Self {
        Envelope {
            kind: FrameKind::Notification,
            data,
            timestamp: now_millis(),
            message_id: message_id.or_else(|| Some(new_message_id())),
        }
    }

    pub fn ping() -> Self {
        Envelope {
            kind: FrameKind::Ping,
            data: Value::Null,
            timestamp: now_millis(),
            message_id: None,
        }
    }

    pub fn pong() -> Self {
        Envelope {
            kind: FrameKind::Pong,
            data: Value::Null,
            timestamp: now_millis(),
            message_id: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a message id: 12 hex digits of unix milliseconds followed by
/// 16 random hex digits. Lexicographic order tracks creation time at
/// millisecond granularity.
pub fn new_message_id() -> String {
    let millis = now_millis().max(0) as u64;
    let suffix: u64 = rand::random();
    format!("{millis:012x}{suffix:016x}")
}
