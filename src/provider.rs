//! Provider trait for inbound sources

use crate::Result;
use crate::types::{Event, LogMessage, RawPacket};

/// One item arriving from outside the distribution core.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Telemetry packet from the link
    Telemetry(RawPacket),
    /// Server log line
    Message(LogMessage),
    /// Application event
    Event(Event),
}

/// Trait for inbound data sources
///
/// Providers abstract over where packets come from (a socket listener, a
/// message bus subscription, a test script) and handle their own waiting.
#[async_trait::async_trait]
pub trait Provider: Send + 'static {
    /// Get the next inbound item
    ///
    /// Returns:
    /// - `Ok(Some(item))` - New item available
    /// - `Ok(None)` - Source ended (normal termination)
    /// - `Err(e)` - Error occurred; the driver retries with backoff
    async fn next(&mut self) -> Result<Option<Inbound>>;
}
