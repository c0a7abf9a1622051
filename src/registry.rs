//! Session registry and fan-out.
//!
//! Every inbound item goes to every registered session and to the history
//! session. Broadcasts are serialized so two concurrent producers can never
//! interleave their pushes into the same channel.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::definitions::Definitions;
use crate::delta::{DeltaEngine, PacketDelta};
use crate::session::{DEFAULT_CAPACITY, HISTORY_CAPACITY, Session, SessionToken};
use crate::types::{DeltaItem, Event, LogMessage, PacketTypeId, TelemetryItem};
use crate::{Result, TelemuxError};

/// Outcome of one telemetry broadcast.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Name of the broadcast packet type
    pub packet: Arc<str>,
    /// Delta shared by every session
    pub delta: Arc<PacketDelta>,
    /// Sessions reached, excluding history
    pub sessions: usize,
}

/// All live sessions plus the permanent history session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionToken, Arc<Session>>>,
    history: Arc<Session>,
    engine: DeltaEngine,
    definitions: Arc<dyn Definitions>,
    fanout: Mutex<()>,
    session_capacity: usize,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("session_capacity", &self.session_capacity)
            .finish()
    }
}

impl SessionRegistry {
    /// Registry with the default channel capacities.
    pub fn new(definitions: Arc<dyn Definitions>) -> Self {
        Self::with_capacity(definitions, DEFAULT_CAPACITY, HISTORY_CAPACITY)
    }

    pub fn with_capacity(
        definitions: Arc<dyn Definitions>,
        session_capacity: usize,
        history_capacity: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            history: Arc::new(Session::new(history_capacity)),
            engine: DeltaEngine::new(Arc::clone(&definitions)),
            definitions,
            fanout: Mutex::new(()),
            session_capacity,
        }
    }

    /// Allocate a session under a fresh token.
    pub fn create_session(&self) -> SessionToken {
        let session = Arc::new(Session::new(self.session_capacity));
        let mut sessions = self.sessions.write();
        let mut token = SessionToken::new();
        while sessions.contains_key(&token) {
            token = SessionToken::new();
        }
        sessions.insert(token, session);
        info!(token = %token, sessions = sessions.len(), "session created");
        token
    }

    /// Look up a live session.
    pub fn current_session(&self, token: &SessionToken) -> Result<Arc<Session>> {
        self.sessions.read().get(token).cloned().ok_or_else(|| TelemuxError::session_not_found(token.to_string()))
    }

    /// Remove a session and close its channels.
    ///
    /// Transport loops still draining the session see their channel close and
    /// exit on their own.
    pub fn remove_session(&self, token: &SessionToken) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(token);
        if let Some(session) = &removed {
            session.close();
            info!(token = %token, "session removed");
        }
        removed
    }

    /// The permanent history session.
    pub fn history(&self) -> &Arc<Session> {
        &self.history
    }

    pub fn engine(&self) -> &DeltaEngine {
        &self.engine
    }

    pub fn definitions(&self) -> &Arc<dyn Definitions> {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn tokens(&self) -> Vec<SessionToken> {
        self.sessions.read().keys().copied().collect()
    }

    fn targets(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read();
        let mut targets = Vec::with_capacity(sessions.len() + 1);
        targets.push(Arc::clone(&self.history));
        targets.extend(sessions.values().cloned());
        targets
    }

    /// Compute the delta of one packet and deliver it to every session.
    ///
    /// Unknown packet ids and packets too short for their layout fail without
    /// touching any channel. A full channel drops its oldest item.
    pub fn broadcast_telemetry(&self, uid: PacketTypeId, data: impl Into<Arc<[u8]>>) -> Result<Broadcast> {
        let Some(defn) = self.definitions.packet(uid) else {
            warn!(uid, "telemetry for unknown packet id");
            return Err(TelemuxError::unknown_packet(uid));
        };
        let data: Arc<[u8]> = data.into();

        let _order = self.fanout.lock();
        let delta = self.engine.compute(&defn, &data)?;

        let packet: Arc<str> = Arc::from(defn.name.as_str());
        let shared_delta = Arc::new(delta.delta.clone());
        let shared_converted = Arc::new(delta.converted.clone());

        let targets = self.targets();
        for session in &targets {
            let counter = session.next_counter(&defn.name);
            session.telemetry.push(TelemetryItem { uid, data: Arc::clone(&data), counter });
            session.deltas.push(DeltaItem {
                packet: Arc::clone(&packet),
                delta: Arc::clone(&shared_delta),
                converted: Arc::clone(&shared_converted),
                counter,
            });
        }

        trace!(packet = %packet, sessions = targets.len() - 1, "telemetry broadcast");
        Ok(Broadcast { packet, delta: Arc::new(delta), sessions: targets.len() - 1 })
    }

    /// Deliver an event to every session.
    pub fn broadcast_event(&self, event: Event) -> usize {
        let _order = self.fanout.lock();
        let targets = self.targets();
        for session in &targets {
            session.events.push(event.clone());
        }
        debug!(event = %event.name, sessions = targets.len() - 1, "event broadcast");
        targets.len() - 1
    }

    /// Deliver a log message to every session.
    pub fn broadcast_message(&self, message: LogMessage) -> usize {
        let _order = self.fanout.lock();
        let targets = self.targets();
        for session in &targets {
            session.messages.push(message.clone());
        }
        targets.len() - 1
    }

    /// Remove sessions with no attached connection that have been idle for
    /// at least `ttl`. Returns the removed tokens.
    pub fn reap_idle(&self, ttl: Duration) -> Vec<SessionToken> {
        let expired: Vec<SessionToken> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.connections() == 0 && s.idle_for() >= ttl)
            .map(|(token, _)| *token)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for token in expired {
            let mut sessions = self.sessions.write();
            // Re-check under the write lock; a client may have attached since.
            let still_idle = sessions.get(&token).is_some_and(|s| s.connections() == 0 && s.idle_for() >= ttl);
            if !still_idle {
                continue;
            }
            if let Some(session) = sessions.remove(&token) {
                session.close();
                reaped.push(token);
            }
        }

        if !reaped.is_empty() {
            info!(reaped = reaped.len(), remaining = self.len(), "idle sessions reaped");
        }
        reaped
    }

    /// Periodically reap idle sessions until `cancel` fires.
    pub fn spawn_reaper(
        self: Arc<Self>,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(ttl_secs = ttl.as_secs(), "session reaper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("session reaper cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reap_idle(ttl);
                    }
                }
            }
        })
    }
}
