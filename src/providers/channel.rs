//! Channel-backed provider fed by link plumbing

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{Inbound, Provider};
use crate::types::{Event, LogMessage, PacketTypeId, RawPacket};
use crate::{Result, TelemuxError};

/// Provider that yields whatever is sent through its [`LinkSender`].
///
/// The stream ends once every sender has been dropped.
#[derive(Debug)]
pub struct ChannelProvider {
    rx: mpsc::Receiver<Inbound>,
    received: u64,
}

impl ChannelProvider {
    /// Create a connected sender/provider pair buffering up to `capacity` items.
    pub fn pair(capacity: usize) -> (LinkSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (LinkSender { tx }, Self { rx, received: 0 })
    }

    /// Items yielded so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait::async_trait]
impl Provider for ChannelProvider {
    async fn next(&mut self) -> Result<Option<Inbound>> {
        match self.rx.recv().await {
            Some(item) => {
                self.received += 1;
                Ok(Some(item))
            }
            None => {
                debug!(received = self.received, "all link senders dropped");
                Ok(None)
            }
        }
    }
}

/// Sending half used by whatever receives packets from the link.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Inbound>,
}

impl LinkSender {
    pub async fn send(&self, item: Inbound) -> Result<()> {
        self.tx.send(item).await.map_err(|_| {
            TelemuxError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "telemetry driver stopped"))
        })
    }

    pub async fn telemetry(&self, uid: PacketTypeId, data: impl Into<Arc<[u8]>>) -> Result<()> {
        self.send(Inbound::Telemetry(RawPacket::new(uid, data))).await
    }

    pub async fn message(&self, message: LogMessage) -> Result<()> {
        self.send(Inbound::Message(message)).await
    }

    pub async fn event(&self, event: Event) -> Result<()> {
        self.send(Inbound::Event(event)).await
    }
}
