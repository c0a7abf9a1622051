//! Per-client sessions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::BoundedChannel;
use crate::types::{DeltaItem, Event, LogMessage, TelemetryItem};
use crate::TelemuxError;

/// Default capacity of each client channel.
pub const DEFAULT_CAPACITY: usize = 100;

/// Capacity of the history session's channels.
pub const HISTORY_CAPACITY: usize = 600;

/// Largest counter value; the next one wraps to 0.
pub const COUNTER_MAX: u32 = i32::MAX as u32;

/// Opaque identifier handed to a client on first connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionToken {
    type Err = TelemuxError;

    /// A malformed token can never name a live session.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self).map_err(|_| TelemuxError::session_not_found(s))
    }
}

/// Next per-type counter value after `previous` (`None` on first delivery).
pub fn advance_counter(previous: Option<u32>) -> u32 {
    match previous {
        None => 0,
        Some(n) if n >= COUNTER_MAX => 0,
        Some(n) => n + 1,
    }
}

/// One client's view of the telemetry stream.
#[derive(Debug)]
pub struct Session {
    pub events: BoundedChannel<Event>,
    pub messages: BoundedChannel<LogMessage>,
    pub telemetry: BoundedChannel<TelemetryItem>,
    pub deltas: BoundedChannel<DeltaItem>,
    counters: Mutex<HashMap<String, u32>>,
    connections: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl Session {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: BoundedChannel::new(capacity),
            messages: BoundedChannel::new(capacity),
            telemetry: BoundedChannel::new(capacity),
            deltas: BoundedChannel::new(capacity),
            counters: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Advance and return this session's counter for `packet`.
    pub fn next_counter(&self, packet: &str) -> u32 {
        let mut counters = self.counters.lock();
        let next = advance_counter(counters.get(packet).copied());
        counters.insert(packet.to_string(), next);
        next
    }

    /// Most recent counter value per packet name.
    pub fn counters(&self) -> HashMap<String, u32> {
        self.counters.lock().clone()
    }

    /// Register a live connection; dropping the guard detaches it.
    pub fn attach(self: &Arc<Self>) -> SessionGuard {
        self.connections.fetch_add(1, Ordering::AcqRel);
        self.touch();
        SessionGuard { session: Arc::clone(self) }
    }

    /// Number of attached connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Time since the session last gained or lost a connection.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_active.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Close all four channels; waiting consumers observe `Closed`.
    pub fn close(&self) {
        self.events.close();
        self.messages.close();
        self.telemetry.close();
        self.deltas.close();
    }
}

/// Keeps a [`Session`] marked as connected.
#[derive(Debug)]
pub struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.connections.fetch_sub(1, Ordering::AcqRel);
        self.session.touch();
    }
}
