use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Liveness of a ring member as disseminated through ping payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Alive,
    Timeout,
    Leaved,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Alive => write!(f, "alive"),
            ProcessStatus::Timeout => write!(f, "timeout"),
            ProcessStatus::Leaved => write!(f, "leaved"),
        }
    }
}

/// A cluster member. Identity is `(ip, port, join_time)`: the same host
/// and port rejoining the ring is a different process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Process {
    pub ip: String,
    pub port: u16,
    pub join_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub status: ProcessStatus,
}

impl Process {
    /// A process that has not joined yet: epoch timestamps, `Alive`.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let epoch = epoch();
        Self {
            ip: ip.into(),
            port,
            join_time: epoch,
            last_update_time: epoch,
            status: ProcessStatus::Alive,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Identity comparison; ignores status and last-update time.
    pub fn same_identity(&self, other: &Process) -> bool {
        self.ip == other.ip && self.port == other.port && self.join_time == other.join_time
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}
