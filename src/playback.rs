//! Historical playback.
//!
//! A playback query buckets archived packets by timestamp rounded down to a
//! tenth of a second. While replaying, the viewer requests buckets one
//! timestamp at a time and live telemetry is dropped so the two streams never
//! mix.
//!
//! ```text
//!          build_query            enter_replay
//!   Live ──────────────▶ QueryBuilt ───────────▶ Replaying
//!    ▲                                               │
//!    └──────────────────────── abort ◀───────────────┘
//! ```

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, trace, warn};

use crate::datastore::{Datastore, DatastoreConnector, TimeRange};
use crate::registry::SessionRegistry;
use crate::types::RawPacket;
use crate::{Result, TelemuxError};

/// Playback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Inbound telemetry is broadcast as it arrives
    Live,
    /// A query is loaded but replay has not started
    QueryBuilt,
    /// Live telemetry is suppressed; buckets are broadcast on request
    Replaying,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackMode::Live => "live",
            PlaybackMode::QueryBuilt => "query_built",
            PlaybackMode::Replaying => "replaying",
        };
        f.write_str(s)
    }
}

/// Archived packets keyed by rounded timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackQuery {
    buckets: BTreeMap<String, Vec<RawPacket>>,
}

impl PlaybackQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket key of `time`: `YYYY-MM-DDTHH:MM:SS.dZ`, rounded down to 0.1 s.
    pub fn bucket_key(time: &DateTime<Utc>) -> String {
        let tenths = (time.timestamp_subsec_millis() / 100).min(9);
        format!("{}.{tenths}Z", time.format("%Y-%m-%dT%H:%M:%S"))
    }

    /// Append `packet` to the bucket of `time`.
    pub fn insert(&mut self, time: &DateTime<Utc>, packet: RawPacket) {
        self.buckets.entry(Self::bucket_key(time)).or_default().push(packet);
    }

    /// Packets of one bucket, in insertion order.
    pub fn get(&self, key: &str) -> Option<&[RawPacket]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Append every bucket of `other`.
    pub fn merge(&mut self, other: PlaybackQuery) {
        for (key, packets) in other.buckets {
            self.buckets.entry(key).or_default().extend(packets);
        }
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of packets across all buckets.
    pub fn packet_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Archived time span of one packet, widened to whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketRange {
    pub packet: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug)]
struct State {
    mode: PlaybackMode,
    query: PlaybackQuery,
}

/// Builds playback queries and gates live telemetry.
pub struct PlaybackController {
    registry: Arc<SessionRegistry>,
    datastore: Option<Arc<dyn Datastore>>,
    state: Mutex<State>,
    mode_tx: watch::Sender<PlaybackMode>,
}

impl fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PlaybackController")
            .field("enabled", &self.is_enabled())
            .field("mode", &state.mode)
            .field("buckets", &state.query.len())
            .finish()
    }
}

impl PlaybackController {
    /// Controller over an already connected datastore (`None` disables playback).
    pub fn new(registry: Arc<SessionRegistry>, datastore: Option<Arc<dyn Datastore>>) -> Self {
        let (mode_tx, _) = watch::channel(PlaybackMode::Live);
        Self {
            registry,
            datastore,
            state: Mutex::new(State { mode: PlaybackMode::Live, query: PlaybackQuery::new() }),
            mode_tx,
        }
    }

    /// Controller with playback permanently disabled.
    pub fn disabled(registry: Arc<SessionRegistry>) -> Self {
        Self::new(registry, None)
    }

    /// Connect to the datastore once.
    ///
    /// A failed connection is logged and disables playback for the lifetime of
    /// the controller; it is not retried.
    pub async fn connect(registry: Arc<SessionRegistry>, connector: Option<&dyn DatastoreConnector>) -> Self {
        let datastore = match connector {
            None => {
                info!("No historical datastore configured; telemetry playback disabled");
                None
            }
            Some(connector) => match connector.connect().await {
                Ok(datastore) => {
                    info!(backend = datastore.name(), "Connected to historical datastore");
                    Some(datastore)
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to historical datastore");
                    warn!("Disabling telemetry playback");
                    None
                }
            },
        };
        Self::new(registry, datastore)
    }

    pub fn is_enabled(&self) -> bool {
        self.datastore.is_some()
    }

    pub fn mode(&self) -> PlaybackMode {
        self.state.lock().mode
    }

    /// Whether inbound live telemetry is currently dropped.
    pub fn suppresses_live(&self) -> bool {
        self.mode() == PlaybackMode::Replaying
    }

    /// Run `f` unless replaying, without letting the mode change meanwhile.
    ///
    /// Live ingest goes through here so a packet can never slip into the
    /// stream after replay has started.
    pub fn with_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.lock();
        if state.mode == PlaybackMode::Replaying {
            return None;
        }
        let result = f();
        drop(state);
        Some(result)
    }

    /// Stream of the current mode followed by every transition.
    pub fn mode_updates(&self) -> WatchStream<PlaybackMode> {
        WatchStream::new(self.mode_tx.subscribe())
    }

    fn set_mode(&self, state: &mut State, mode: PlaybackMode) {
        if state.mode != mode {
            info!(from = %state.mode, to = %mode, "Playback mode changed");
            state.mode = mode;
            self.mode_tx.send_replace(mode);
        }
    }

    fn datastore(&self) -> Result<&Arc<dyn Datastore>> {
        self.datastore.as_ref().ok_or(TelemuxError::PlaybackDisabled)
    }

    /// Archived span of every packet. Empty when playback is disabled.
    pub async fn ranges(&self) -> Result<Vec<PacketRange>> {
        let Some(datastore) = &self.datastore else {
            return Ok(Vec::new());
        };

        let spans = datastore.spans().await?;
        Ok(spans
            .into_iter()
            .map(|span| PacketRange {
                packet: span.packet,
                start: span.first.trunc_subsecs(0).format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                end: (span.last.trunc_subsecs(0) + TimeDelta::seconds(1)).format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            })
            .collect())
    }

    /// Load the archived rows of `packet` in `range` into the playback query.
    ///
    /// Rows are re-encoded into the packet's binary layout so replay goes
    /// through the same path as live telemetry. Successive calls merge into
    /// one query. Rows that cannot be re-encoded are skipped. Returns a
    /// snapshot of the merged query.
    pub async fn build_query(&self, packet: &str, range: &TimeRange) -> Result<PlaybackQuery> {
        let datastore = self.datastore()?;
        let defn = self
            .registry
            .definitions()
            .packet_named(packet)
            .ok_or_else(|| TelemuxError::unknown_packet(packet))?;

        let rows = datastore.query(&defn.name, range).await?;

        let mut loaded = PlaybackQuery::new();
        let mut skipped = 0usize;
        for row in &rows {
            match defn.encode(&row.fields) {
                Ok(bytes) => loaded.insert(&row.time, RawPacket::new(defn.uid, bytes)),
                Err(e) => {
                    skipped += 1;
                    warn!(packet = %defn.name, time = %row.time, error = %e, "Skipping archived row");
                }
            }
        }

        info!(
            packet = %defn.name,
            rows = rows.len(),
            skipped,
            buckets = loaded.len(),
            "Playback query built"
        );

        let mut state = self.state.lock();
        state.query.merge(loaded);
        if state.mode == PlaybackMode::Live {
            self.set_mode(&mut state, PlaybackMode::QueryBuilt);
        }
        Ok(state.query.clone())
    }

    /// Start replaying; live telemetry is suppressed from now on.
    pub fn enter_replay(&self) -> Result<()> {
        self.datastore()?;
        let mut state = self.state.lock();
        self.set_mode(&mut state, PlaybackMode::Replaying);
        Ok(())
    }

    /// Broadcast every packet of the bucket keyed `timestamp`.
    ///
    /// Outside replay, or for an unknown timestamp, nothing is sent. Returns
    /// the number of packets broadcast.
    pub fn dispatch(&self, timestamp: &str) -> usize {
        let state = self.state.lock();
        if state.mode != PlaybackMode::Replaying {
            debug!(timestamp, mode = %state.mode, "Dispatch outside replay ignored");
            return 0;
        }
        let Some(packets) = state.query.get(timestamp) else {
            trace!(timestamp, "No archived packets at timestamp");
            return 0;
        };

        let mut sent = 0;
        for packet in packets {
            match self.registry.broadcast_telemetry(packet.uid, Arc::clone(&packet.data)) {
                Ok(_) => sent += 1,
                Err(e) => warn!(uid = packet.uid, error = %e, "Failed to replay archived packet"),
            }
        }
        sent
    }

    /// Drop the query and return to live. Returns the number of packets dropped.
    ///
    /// Callers should also clear the raw telemetry channel of the requesting
    /// session so replayed packets do not leak into the live view.
    pub fn abort(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.query.packet_count();
        state.query.clear();
        self.set_mode(&mut state, PlaybackMode::Live);
        dropped
    }

    /// Snapshot of the loaded query.
    pub fn query(&self) -> PlaybackQuery {
        self.state.lock().query.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::test_utils::{FailingConnector, HK_UID, HkFrame, fixture_definitions, hs_bytes};
    use chrono::TimeZone;
    use futures::StreamExt;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<SessionRegistry>, Arc<MemoryDatastore>, PlaybackController) {
        let definitions = fixture_definitions();
        let registry = Arc::new(SessionRegistry::new(definitions));
        let store = Arc::new(MemoryDatastore::new());
        let controller = PlaybackController::new(Arc::clone(&registry), Some(Arc::clone(&store) as Arc<dyn Datastore>));
        (registry, store, controller)
    }

    fn record_hk(registry: &SessionRegistry, store: &MemoryDatastore, time: DateTime<Utc>, frame: HkFrame) -> Vec<u8> {
        let hk = registry.definitions().packet(HK_UID).unwrap();
        let bytes = frame.bytes();
        store.record(&hk, time, &bytes).unwrap();
        bytes
    }

    #[test]
    fn bucket_keys_round_down_to_tenths() {
        let t = t0() + TimeDelta::milliseconds(1_999);
        assert_eq!(PlaybackQuery::bucket_key(&t), "2024-03-01T12:00:01.9Z");
        assert_eq!(PlaybackQuery::bucket_key(&t0()), "2024-03-01T12:00:00.0Z");
    }

    #[tokio::test]
    async fn build_query_buckets_rows_byte_for_byte() {
        let (registry, store, controller) = setup();
        let originals: Vec<Vec<u8>> = (0..3)
            .map(|i| {
                let frame = HkFrame::default().voltages(100 + i as u16, 7).mode(1).temp(-20);
                record_hk(&registry, &store, t0() + TimeDelta::seconds(i), frame)
            })
            .collect();

        let range = TimeRange::new(t0(), t0() + TimeDelta::seconds(10)).unwrap();
        let query = controller.build_query("HK", &range).await.unwrap();

        assert_eq!(query.len(), 3);
        let keys: Vec<&str> = query.keys().collect();
        assert_eq!(keys, vec!["2024-03-01T12:00:00.0Z", "2024-03-01T12:00:01.0Z", "2024-03-01T12:00:02.0Z"]);
        for (key, original) in keys.iter().zip(&originals) {
            let bucket = query.get(key).unwrap();
            assert_eq!(bucket.len(), 1);
            assert_eq!(bucket[0].uid, HK_UID);
            assert_eq!(&bucket[0].data[..], &original[..]);
        }
        assert_eq!(controller.mode(), PlaybackMode::QueryBuilt);
    }

    #[tokio::test]
    async fn successive_queries_merge() {
        let (registry, store, controller) = setup();
        record_hk(&registry, &store, t0(), HkFrame::default());
        let hs = registry.definitions().packet_named("1553_HS").unwrap();
        store.record(&hs, t0() + TimeDelta::milliseconds(50), &hs_bytes(1, 2, 3.0)).unwrap();

        let range = TimeRange::new(t0(), t0() + TimeDelta::seconds(1)).unwrap();
        controller.build_query("HK", &range).await.unwrap();
        let merged = controller.build_query("1553_HS", &range).await.unwrap();

        assert_eq!(merged.len(), 1);
        let bucket = merged.get("2024-03-01T12:00:00.0Z").unwrap();
        assert_eq!(bucket.iter().map(|p| p.uid).collect::<Vec<_>>(), vec![HK_UID, hs.uid]);
    }

    #[tokio::test]
    async fn rows_that_cannot_be_encoded_are_skipped() {
        let (registry, store, controller) = setup();
        record_hk(&registry, &store, t0(), HkFrame::default());
        let mut bad = store.query("HK", &TimeRange::new(t0(), t0()).unwrap()).await.unwrap().remove(0);
        bad.time = t0() + TimeDelta::seconds(1);
        bad.fields.insert("Mode".into(), crate::types::Value::UInt(300));
        store.insert("HK", bad);

        let range = TimeRange::new(t0(), t0() + TimeDelta::seconds(5)).unwrap();
        let query = controller.build_query("HK", &range).await.unwrap();
        assert_eq!(query.packet_count(), 1);
    }

    #[tokio::test]
    async fn unknown_packet_names_fail() {
        let (_, _, controller) = setup();
        let range = TimeRange::new(t0(), t0()).unwrap();
        let err = controller.build_query("NOPE", &range).await.unwrap_err();
        assert!(matches!(err, TelemuxError::UnknownPacket { .. }));
    }

    #[tokio::test]
    async fn dispatch_broadcasts_only_while_replaying() {
        let (registry, store, controller) = setup();
        let token = registry.create_session();
        record_hk(&registry, &store, t0(), HkFrame::default());
        controller.build_query("HK", &TimeRange::new(t0(), t0()).unwrap()).await.unwrap();

        assert_eq!(controller.dispatch("2024-03-01T12:00:00.0Z"), 0);

        controller.enter_replay().unwrap();
        assert!(controller.suppresses_live());
        assert_eq!(controller.dispatch("2024-03-01T12:00:00.0Z"), 1);
        assert_eq!(controller.dispatch("2024-03-01T12:00:05.0Z"), 0);

        let session = registry.current_session(&token).unwrap();
        assert_eq!(session.telemetry.len(), 1);
    }

    #[tokio::test]
    async fn abort_clears_query_and_returns_to_live() {
        let (registry, store, controller) = setup();
        record_hk(&registry, &store, t0(), HkFrame::default());
        controller.build_query("HK", &TimeRange::new(t0(), t0()).unwrap()).await.unwrap();
        controller.enter_replay().unwrap();
        assert_eq!(controller.with_live(|| ()), None);

        assert_eq!(controller.abort(), 1);
        assert!(controller.query().is_empty());
        assert_eq!(controller.mode(), PlaybackMode::Live);
        assert_eq!(controller.with_live(|| 5), Some(5));
    }

    #[tokio::test]
    async fn ranges_widen_to_whole_seconds() {
        let (registry, store, controller) = setup();
        record_hk(&registry, &store, t0() + TimeDelta::milliseconds(400), HkFrame::default());
        record_hk(&registry, &store, t0() + TimeDelta::milliseconds(2_300), HkFrame::default());

        let ranges = controller.ranges().await.unwrap();
        assert_eq!(
            ranges,
            vec![PacketRange {
                packet: "HK".into(),
                start: "2024-03-01T12:00:00Z".into(),
                end: "2024-03-01T12:00:03Z".into(),
            }]
        );
    }

    #[tokio::test]
    async fn failed_connection_disables_playback() {
        let _ = tracing_subscriber::fmt::try_init();
        let registry = Arc::new(SessionRegistry::new(fixture_definitions()));
        let controller = PlaybackController::connect(registry, Some(&FailingConnector)).await;

        assert!(!controller.is_enabled());
        assert!(controller.ranges().await.unwrap().is_empty());
        let range = TimeRange::new(t0(), t0()).unwrap();
        assert!(matches!(controller.build_query("HK", &range).await, Err(TelemuxError::PlaybackDisabled)));
        assert!(matches!(controller.enter_replay(), Err(TelemuxError::PlaybackDisabled)));
        assert_eq!(controller.abort(), 0);
    }

    #[tokio::test]
    async fn mode_updates_follow_transitions() {
        let (registry, store, controller) = setup();
        let mut updates = controller.mode_updates();
        assert_eq!(updates.next().await, Some(PlaybackMode::Live));

        record_hk(&registry, &store, t0(), HkFrame::default());
        controller.build_query("HK", &TimeRange::new(t0(), t0()).unwrap()).await.unwrap();
        assert_eq!(updates.next().await, Some(PlaybackMode::QueryBuilt));

        controller.enter_replay().unwrap();
        assert_eq!(updates.next().await, Some(PlaybackMode::Replaying));

        controller.abort();
        assert_eq!(updates.next().await, Some(PlaybackMode::Live));
    }
}
