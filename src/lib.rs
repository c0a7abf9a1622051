//! Telemetry fan-out, delta computation and archive playback for ground-system viewers.
//!
//! Telemux sits between a telemetry link and any number of connected viewer
//! clients. Every inbound packet is decoded once, diffed against the last
//! packet of its type and pushed to every client session, both raw and as a
//! compact delta. A playback controller can swap the live stream for packets
//! replayed from a time-indexed archive.
//!
//! # Features
//!
//! - **Fan-out**: bounded per-client channels that drop the oldest item instead of blocking the link
//! - **Deltas**: per-packet-type change sets with converted, enumerated and derived values
//! - **Playback**: archive queries bucketed at 0.1 s, replayed through the live path
//! - **Transports**: event-stream and binary framing with idle keepalive probes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemux::datastore::MemoryDatastore;
//! use telemux::transport::{Frame, StreamKind};
//! use telemux::{Dictionary, Telemux, TelemuxConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> telemux::Result<()> {
//!     let archive = Arc::new(MemoryDatastore::new());
//!     let telemux = Telemux::start(Arc::new(Dictionary::new()), Some(&archive), TelemuxConfig::default()).await?;
//!
//!     let token = telemux.create_session();
//!     let (tx, mut rx) = tokio::sync::mpsc::channel::<Frame>(64);
//!     let transport = telemux.transport(&token.to_string(), StreamKind::Deltas, tx)?;
//!     tokio::spawn(transport.run());
//!
//!     while let Some(frame) = rx.recv().await {
//!         println!("{frame:?}");
//!     }
//!     Ok(())
//! }
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod channel;
pub mod config;
pub mod datastore;
pub mod definitions;
pub mod delta;
pub mod driver;
mod error;
pub mod playback;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transport;
pub mod types;

// Core exports
pub use channel::{BoundedChannel, PopError};
pub use config::TelemuxConfig;
pub use definitions::{Definitions, Dictionary};
pub use delta::{DeltaEngine, PacketDelta, PacketState};
pub use driver::{Delivery, Driver, DriverHandle};
pub use error::*;
pub use playback::{PacketRange, PlaybackController, PlaybackMode, PlaybackQuery};
pub use registry::SessionRegistry;
pub use session::{Session, SessionToken};

use datastore::{DatastoreConnector, TimeRange};
use provider::{Inbound, Provider};
use transport::{FrameSink, StreamKind, StreamTransport};
use types::{Event, LogMessage, PacketTypeId, RawPacket};

/// Latest value of every packet type plus one session's counters.
#[derive(Debug, Clone, Serialize)]
pub struct LatestState {
    pub states: BTreeMap<String, PacketState>,
    pub counters: HashMap<String, u32>,
}

/// Telemetry distribution service.
///
/// Owns the session registry, the delta engine and the playback controller,
/// and exposes the control surface used by the HTTP layer. Dropping it stops
/// the idle-session reaper and every transport created through it.
pub struct Telemux {
    config: TelemuxConfig,
    registry: Arc<SessionRegistry>,
    playback: Arc<PlaybackController>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Telemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemux")
            .field("sessions", &self.registry.len())
            .field("playback", &self.playback.mode())
            .finish()
    }
}

impl Telemux {
    /// Start the service.
    ///
    /// Connects to the datastore once; a failed connection disables playback
    /// but does not fail startup. Must be called within a Tokio runtime when
    /// idle-session reaping is enabled.
    pub async fn start(
        definitions: Arc<dyn Definitions>,
        connector: Option<&dyn DatastoreConnector>,
        config: TelemuxConfig,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::with_capacity(
            definitions,
            config.session_capacity,
            config.history_capacity,
        ));
        let playback = Arc::new(PlaybackController::connect(Arc::clone(&registry), connector).await);
        let cancel = CancellationToken::new();

        if let Some(ttl) = config.session_idle_ttl() {
            Arc::clone(&registry).spawn_reaper(ttl, config.reaper_interval(), cancel.child_token());
        }

        info!(
            session_capacity = config.session_capacity,
            history_capacity = config.history_capacity,
            playback = playback.is_enabled(),
            "Telemux started"
        );
        Ok(Self { config, registry, playback, cancel })
    }

    pub fn config(&self) -> &TelemuxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn playback(&self) -> &Arc<PlaybackController> {
        &self.playback
    }

    /// Stop the reaper and every transport created through this service.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn create_session(&self) -> SessionToken {
        self.registry.create_session()
    }

    /// Session named by a client-supplied token.
    pub fn current_session(&self, token: &str) -> Result<Arc<Session>> {
        let token: SessionToken = token.parse()?;
        self.registry.current_session(&token)
    }

    pub fn remove_session(&self, token: &str) -> Result<()> {
        let token: SessionToken = token.parse()?;
        self.registry
            .remove_session(&token)
            .map(|_| ())
            .ok_or_else(|| TelemuxError::session_not_found(token.to_string()))
    }

    /// Feed one live packet. Dropped while playback is replaying.
    pub fn ingest_telemetry(&self, uid: PacketTypeId, data: impl Into<Arc<[u8]>>) -> Result<Delivery> {
        driver::route(&self.registry, &self.playback, Inbound::Telemetry(RawPacket::new(uid, data)))
    }

    /// Forward a server log line to every session.
    pub fn ingest_message(&self, message: LogMessage) -> usize {
        self.registry.broadcast_message(message)
    }

    /// Broadcast a named event to every session.
    pub fn post_event(&self, name: impl Into<String>, data: serde_json::Value) -> usize {
        self.registry.broadcast_event(Event::new(name, data))
    }

    /// Spawn an ingestion task for an inbound source.
    pub fn spawn_provider<P: Provider>(&self, provider: P) -> DriverHandle {
        Driver::spawn(provider, Arc::clone(&self.registry), Arc::clone(&self.playback))
    }

    /// Latest state of every packet type and the session's counters.
    pub fn latest(&self, token: &str) -> Result<LatestState> {
        let session = self.current_session(token)?;
        Ok(LatestState { states: self.registry.engine().latest(), counters: session.counters() })
    }

    /// Delivery loop for one client connection on `token`'s session.
    ///
    /// The session counts as attached only once `run()` starts. If the reaper
    /// removes it before then, the loop ends at once with `SessionClosed`.
    pub fn transport<S: FrameSink>(&self, token: &str, kind: StreamKind, sink: S) -> Result<StreamTransport<S>> {
        let session = self.current_session(token)?;
        Ok(StreamTransport::new(session, kind, sink)
            .with_keepalive(self.config.keepalive())
            .with_cancellation(self.cancel.child_token()))
    }

    /// Archived span of every packet; empty when playback is disabled.
    pub async fn playback_ranges(&self) -> Result<Vec<PacketRange>> {
        self.playback.ranges().await
    }

    /// Load archived packets of `packet` between two RFC 3339 timestamps.
    pub async fn build_query(&self, packet: &str, start: &str, end: &str) -> Result<PlaybackQuery> {
        let range = TimeRange::parse(start, end)?;
        self.playback.build_query(packet, &range).await
    }

    pub fn enter_replay(&self) -> Result<()> {
        self.playback.enter_replay()
    }

    /// Broadcast the archived packets bucketed at `timestamp`.
    pub fn dispatch(&self, timestamp: &str) -> usize {
        self.playback.dispatch(timestamp)
    }

    /// Return to live telemetry and clear the session's replayed packets.
    ///
    /// Playback is reset even when the token is unknown.
    pub fn abort_playback(&self, token: &str) -> Result<usize> {
        let dropped = self.playback.abort();
        let session = self.current_session(token)?;
        session.telemetry.clear();
        Ok(dropped)
    }
}

impl Drop for Telemux {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
