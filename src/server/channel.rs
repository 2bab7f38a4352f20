//! Host broadcast channels
//!
//! The two categories this host routes connections into, selected by the
//! upgrade request path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Path prefix for WebSocket endpoints
pub const WS_PATH_PREFIX: &str = "/ws/";

/// Broadcast category of a host connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Bidirectional control traffic; text is relayed to every control peer
    Control,
    /// Periodic server telemetry, push only
    Telemetry,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Control, Channel::Telemetry];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::Telemetry => "telemetry",
        }
    }

    /// Route a request path such as `/ws/control`
    pub fn from_path(path: &str) -> Option<Self> {
        path.strip_prefix(WS_PATH_PREFIX)
            .map(|rest| rest.trim_end_matches('/'))
            .and_then(|name| name.parse().ok())
    }

    pub fn path(&self) -> String {
        format!("{}{}", WS_PATH_PREFIX, self.as_str())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| format!("unknown channel: {}", s))
    }
}
