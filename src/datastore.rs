//! Historical datastore collaborator.
//!
//! Playback reads archived packets through the [`Datastore`] trait. The query
//! language of the real store stays behind the trait; the core only asks for
//! the rows of one packet inside a time range.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::types::{PacketDefinition, Value};
use crate::{Result, TelemuxError};

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Range from `start` to `end`; fails when `end` precedes `start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(TelemuxError::invalid_time_range(format!("end {end} is before start {start}")));
        }
        Ok(Self { start, end })
    }

    /// Range from two RFC 3339 timestamps.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| TelemuxError::invalid_time_range(format!("'{s}': {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        self.start <= *time && *time <= self.end
    }
}

/// One archived packet: decoded field values and their timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRow {
    pub time: DateTime<Utc>,
    pub fields: HashMap<String, Value>,
}

/// Time span covered by the archive for one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpan {
    pub packet: String,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// Time-indexed archive of decoded packets.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Rows of `packet` inside `range`, oldest first.
    async fn query(&self, packet: &str, range: &TimeRange) -> Result<Vec<ArchiveRow>>;

    /// Covered span of every archived packet.
    async fn spans(&self) -> Result<Vec<ArchiveSpan>>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str;
}

/// Establishes the datastore connection once at startup.
#[async_trait]
pub trait DatastoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Datastore>>;
}

/// In-memory archive.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    rows: RwLock<BTreeMap<String, Vec<ArchiveRow>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive a row, keeping rows of each packet ordered by time.
    pub fn insert(&self, packet: impl Into<String>, row: ArchiveRow) {
        let mut rows = self.rows.write();
        let packet_rows = rows.entry(packet.into()).or_default();
        let at = packet_rows.partition_point(|r| r.time <= row.time);
        packet_rows.insert(at, row);
    }

    /// Decode `data` with `defn` and archive the result.
    pub fn record(&self, defn: &PacketDefinition, time: DateTime<Utc>, data: &[u8]) -> Result<()> {
        let fields = defn.decode(data)?.into_iter().collect();
        self.insert(defn.name.clone(), ArchiveRow { time, fields });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn query(&self, packet: &str, range: &TimeRange) -> Result<Vec<ArchiveRow>> {
        let rows = self.rows.read();
        Ok(rows
            .get(packet)
            .map(|rows| rows.iter().filter(|r| range.contains(&r.time)).cloned().collect())
            .unwrap_or_default())
    }

    async fn spans(&self) -> Result<Vec<ArchiveSpan>> {
        let rows = self.rows.read();
        Ok(rows
            .iter()
            .filter_map(|(packet, rows)| {
                Some(ArchiveSpan { packet: packet.clone(), first: rows.first()?.time, last: rows.last()?.time })
            })
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl DatastoreConnector for Arc<MemoryDatastore> {
    async fn connect(&self) -> Result<Arc<dyn Datastore>> {
        Ok(Arc::clone(self) as Arc<dyn Datastore>)
    }
}
