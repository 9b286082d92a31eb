//! Identifier and payload types shared across the hub.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A platform user. Assigned by the account system upstream; the hub only
/// routes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(UserId(s.parse()?))
    }
}

impl From<u64> for UserId {
    fn from(v: u64) -> Self {
        UserId(v)
    }
}

/// A notification handed to the hub by business code: new-post
/// announcements, comment replies, moderation notices. The body is opaque
/// JSON; the hub transports it without inspecting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub body: serde_json::Value,
    /// Caller-supplied correlation id. When absent the hub stamps one at
    /// send time.
    pub message_id: Option<String>,
}

impl Notification {
    pub fn new(body: serde_json::Value) -> Self {
        Notification {
            body,
            message_id: None,
        }
    }

    pub fn with_message_id(body: serde_json::Value, message_id: impl Into<String>) -> Self {
        Notification {
            body,
            message_id: Some(message_id.into()),
        }
    }
}
