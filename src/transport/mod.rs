//! Per-connection delivery loops.
//!
//! A [`StreamTransport`] drains one channel of one session onto a client
//! connection. Event and log streams use text event-stream framing; raw
//! telemetry uses [`binary`] frames and deltas use JSON text messages. When a
//! channel stays empty for the keepalive timeout the loop sends a probe so
//! proxies keep the connection open.
//!
//! The loop ends when the connection breaks, the session is closed or the
//! cancellation token fires. None of these affect other sessions.

pub mod binary;
pub mod sse;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::channel::PopError;
use crate::session::Session;

/// Idle time after which a probe is sent.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// One message written to a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Write side of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame; an error means the connection is gone.
    async fn send(&mut self, frame: Frame) -> io::Result<()>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<Frame> {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client connection closed"))
    }
}

/// Which session channel a transport drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Application events, text event-stream
    Events,
    /// Server log messages, text event-stream
    Messages,
    /// Raw packets, binary frames
    Telemetry,
    /// Delta envelopes, JSON text messages
    Deltas,
}

impl StreamKind {
    /// Whether the stream uses text event-stream framing.
    pub fn is_event_stream(&self) -> bool {
        matches!(self, StreamKind::Events | StreamKind::Messages)
    }

    /// Frame sent after an idle timeout.
    pub fn keepalive(&self) -> Frame {
        if self.is_event_stream() { Frame::Text(sse::probe()) } else { Frame::Binary(binary::keepalive()) }
    }
}

/// Why a transport loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportEnd {
    /// The client connection broke
    #[default]
    Disconnected,
    /// The session was removed
    SessionClosed,
    /// The cancellation token fired
    Cancelled,
}

/// Summary of a finished transport loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub delivered: u64,
    pub probes: u64,
    pub skipped: u64,
    pub end: TransportEnd,
}

enum Next {
    Frame(Frame),
    Skip,
    Idle,
    Closed,
}

/// Delivery loop of one client connection.
pub struct StreamTransport<S> {
    session: Arc<Session>,
    kind: StreamKind,
    sink: S,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl<S: FrameSink> StreamTransport<S> {
    pub fn new(session: Arc<Session>, kind: StreamKind, sink: S) -> Self {
        Self { session, kind, sink, keepalive: KEEPALIVE_TIMEOUT, cancel: CancellationToken::new() }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops this loop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serialize queued items onto the sink until the loop ends.
    ///
    /// The session counts as connected while this runs.
    pub async fn run(mut self) -> TransportStats {
        let _guard = self.session.attach();
        let mut stats = TransportStats::default();
        debug!(kind = ?self.kind, "stream opened");

        if self.kind.is_event_stream() && self.sink.send(Frame::Text(sse::connected())).await.is_err() {
            return stats;
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    stats.end = TransportEnd::Cancelled;
                    break;
                }
                next = next_item(&self.session, self.kind, self.keepalive) => next,
            };

            let frame = match next {
                Next::Frame(frame) => {
                    stats.delivered += 1;
                    frame
                }
                Next::Idle => {
                    stats.probes += 1;
                    self.kind.keepalive()
                }
                Next::Skip => {
                    stats.skipped += 1;
                    continue;
                }
                Next::Closed => {
                    stats.end = TransportEnd::SessionClosed;
                    break;
                }
            };

            let sent = tokio::select! {
                _ = self.cancel.cancelled() => {
                    stats.end = TransportEnd::Cancelled;
                    break;
                }
                sent = self.sink.send(frame) => sent,
            };
            if let Err(e) = sent {
                debug!(kind = ?self.kind, error = %e, "client went away");
                stats.end = TransportEnd::Disconnected;
                break;
            }
        }

        debug!(
            kind = ?self.kind,
            delivered = stats.delivered,
            probes = stats.probes,
            end = ?stats.end,
            "stream closed"
        );
        stats
    }
}

/// Pop the next item of `kind` and serialize it.
async fn next_item(session: &Session, kind: StreamKind, keepalive: Duration) -> Next {
    let popped: std::result::Result<Result<Frame>, PopError> = match kind {
        StreamKind::Events => session.events.pop(keepalive).await.map(|event| sse::data(&event).map(Frame::Text)),
        StreamKind::Messages => {
            session.messages.pop(keepalive).await.map(|message| sse::data(&message).map(Frame::Text))
        }
        StreamKind::Telemetry => session
            .telemetry
            .pop(keepalive)
            .await
            .map(|item| Ok(Frame::Binary(binary::encode_packet(item.uid, &item.data)))),
        StreamKind::Deltas => session
            .deltas
            .pop(keepalive)
            .await
            .map(|item| serde_json::to_string(&item).map(Frame::Text).map_err(Into::into)),
    };

    match popped {
        Ok(Ok(frame)) => Next::Frame(frame),
        Ok(Err(e)) => {
            warn!(kind = ?kind, error = %e, "dropping item that failed to serialize");
            Next::Skip
        }
        Err(PopError::Empty) => Next::Idle,
        Err(PopError::Closed) => Next::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeltaItem, Event, FieldMap, LogMessage, Severity, TelemetryItem, Value};

    fn spawn(
        session: &Arc<Session>,
        kind: StreamKind,
    ) -> (mpsc::Receiver<Frame>, CancellationToken, tokio::task::JoinHandle<TransportStats>) {
        let (tx, rx) = mpsc::channel(16);
        let transport = StreamTransport::new(Arc::clone(session), kind, tx);
        let cancel = transport.cancellation();
        (rx, cancel, tokio::spawn(transport.run()))
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_sends_sentinel_items_and_probes() {
        let session = Arc::new(Session::new(8));
        session.events.push(Event::new("seq:done", serde_json::json!({"ok": true})));
        let (mut rx, cancel, task) = spawn(&session, StreamKind::Events);

        assert_eq!(rx.recv().await, Some(Frame::Text(sse::connected())));
        let Some(Frame::Text(item)) = rx.recv().await else { panic!("expected text frame") };
        assert_eq!(item, "data: {\"name\":\"seq:done\",\"data\":{\"ok\":true}}\n\n");

        let before = tokio::time::Instant::now();
        assert_eq!(rx.recv().await, Some(Frame::Text(sse::probe())));
        assert!(before.elapsed() >= KEEPALIVE_TIMEOUT);

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.probes, 1);
        assert_eq!(stats.end, TransportEnd::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn message_stream_serializes_log_lines() {
        let session = Arc::new(Session::new(8));
        session.messages.push(LogMessage::new(Severity::Warning, "limit crossed"));
        let (mut rx, cancel, task) = spawn(&session, StreamKind::Messages);

        rx.recv().await;
        let Some(Frame::Text(line)) = rx.recv().await else { panic!("expected text frame") };
        assert!(line.starts_with("data: {"));
        assert!(line.contains("\"severity\":\"warning\""));
        assert!(line.contains("\"message\":\"limit crossed\""));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_stream_sends_binary_frames_and_null_packets() {
        let session = Arc::new(Session::new(8));
        session.telemetry.push(TelemetryItem { uid: 7, data: Arc::from(&[0x00u8, 0x01][..]), counter: 0 });
        let (mut rx, cancel, task) = spawn(&session, StreamKind::Telemetry);

        assert_eq!(rx.recv().await, Some(Frame::Binary(binary::encode_packet(7, &[0x00, 0x01]))));
        let Some(Frame::Binary(probe)) = rx.recv().await else { panic!("expected binary frame") };
        assert!(binary::is_keepalive(&probe));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delta_stream_sends_json_envelopes() {
        let session = Arc::new(Session::new(8));
        let mut delta = FieldMap::new();
        delta.insert("Voltage_A".into(), Value::UInt(10));
        let mut converted = FieldMap::new();
        converted.insert("Voltage_A".into(), Value::Float(5.0));
        session.deltas.push(DeltaItem {
            packet: "HK".into(),
            delta: Arc::new(delta),
            converted: Arc::new(converted),
            counter: 4,
        });
        let (mut rx, cancel, task) = spawn(&session, StreamKind::Deltas);

        let Some(Frame::Text(json)) = rx.recv().await else { panic!("expected text frame") };
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!({"packet": "HK", "data": {"Voltage_A": 10}, "dntoeus": {"Voltage_A": 5.0}, "counter": 4})
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn broken_connection_ends_only_this_loop() {
        let session = Arc::new(Session::new(8));
        let (rx, _cancel, task) = spawn(&session, StreamKind::Events);
        drop(rx);

        let stats = task.await.unwrap();
        assert_eq!(stats.end, TransportEnd::Disconnected);
        assert_eq!(session.connections(), 0);
        assert!(!session.events.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_ends_the_loop() {
        let session = Arc::new(Session::new(8));
        let (mut rx, _cancel, task) = spawn(&session, StreamKind::Deltas);
        tokio::task::yield_now().await;
        assert_eq!(session.connections(), 1);

        session.close();
        let stats = task.await.unwrap();
        assert_eq!(stats.end, TransportEnd::SessionClosed);
        assert!(rx.recv().await.is_none());
    }
}
