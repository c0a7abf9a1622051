//! Items carried by session channels

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{FieldMap, PacketTypeId};

/// Raw packet as delivered to one session, stamped with that session's counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryItem {
    pub uid: PacketTypeId,
    pub data: Arc<[u8]>,
    pub counter: u32,
}

/// Delta view of a packet as delivered to one session.
///
/// `delta` and `converted` are computed once per inbound packet and shared by
/// every session; only `counter` is session-scoped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaItem {
    pub packet: Arc<str>,
    #[serde(rename = "data")]
    pub delta: Arc<FieldMap>,
    #[serde(rename = "dntoeus")]
    pub converted: Arc<FieldMap>,
    pub counter: u32,
}

/// Named application event (`POST /events`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self { name: name.into(), data }
    }
}

/// Log severity of a [`LogMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Server log line forwarded to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl LogMessage {
    /// Message stamped with the current time.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), severity, message: message.into() }
    }
}
