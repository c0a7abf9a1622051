//! Driver spawns and manages inbound ingestion tasks

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::Result;
use crate::playback::PlaybackController;
use crate::provider::{Inbound, Provider};
use crate::registry::SessionRegistry;

/// What happened to one routed inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fanned out to this many sessions (history excluded)
    Broadcast(usize),
    /// Live telemetry dropped because playback is replaying
    Suppressed,
}

/// Route one inbound item to every session.
///
/// Live telemetry is dropped while playback is replaying.
pub fn route(registry: &SessionRegistry, playback: &PlaybackController, item: Inbound) -> Result<Delivery> {
    match item {
        Inbound::Telemetry(packet) => {
            match playback.with_live(|| registry.broadcast_telemetry(packet.uid, packet.data)) {
                Some(broadcast) => Ok(Delivery::Broadcast(broadcast?.sessions)),
                None => {
                    trace!(uid = packet.uid, "live telemetry suppressed during replay");
                    Ok(Delivery::Suppressed)
                }
            }
        }
        Inbound::Message(message) => Ok(Delivery::Broadcast(registry.broadcast_message(message))),
        Inbound::Event(event) => Ok(Delivery::Broadcast(registry.broadcast_event(event))),
    }
}

/// Counters of a finished ingestion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub received: u64,
    pub suppressed: u64,
    pub rejected: u64,
}

/// Handle to a running ingestion task
pub struct DriverHandle {
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
    task: JoinHandle<DriverStats>,
}

impl DriverHandle {
    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(self) -> DriverStats {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the provider to end on its own.
    pub async fn join(self) -> DriverStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Ingestion task failed");
                DriverStats::default()
            }
        }
    }
}

/// Driver spawns and manages ingestion tasks
///
/// One task per inbound source. The task owns the provider and routes every
/// item through the registry, so any number of sources can feed the same
/// sessions concurrently.
pub struct Driver;

impl Driver {
    /// Spawn an ingestion task for the given provider
    pub fn spawn<P>(provider: P, registry: Arc<SessionRegistry>, playback: Arc<PlaybackController>) -> DriverHandle
    where
        P: Provider,
    {
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        let task = tokio::spawn(async move { Self::ingest_task(provider, registry, playback, cancel_task).await });

        DriverHandle { cancel, task }
    }

    async fn ingest_task<P>(
        mut provider: P,
        registry: Arc<SessionRegistry>,
        playback: Arc<PlaybackController>,
        cancel: CancellationToken,
    ) -> DriverStats
    where
        P: Provider,
    {
        info!("Ingestion task started");
        let mut stats = DriverStats::default();
        let mut error_count = 0u32;
        const MAX_ERRORS: u32 = 10;

        loop {
            // Use select to allow cancellation during provider.next()
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Ingestion cancelled");
                    break;
                }
                result = provider.next() => result,
            };

            match result {
                Ok(Some(item)) => {
                    stats.received += 1;
                    error_count = 0; // Reset error count on success

                    match route(&registry, &playback, item) {
                        Ok(Delivery::Broadcast(sessions)) => trace!(sessions, "inbound item delivered"),
                        Ok(Delivery::Suppressed) => stats.suppressed += 1,
                        Err(e) => {
                            // Bad packets are the sender's problem, not the provider's.
                            stats.rejected += 1;
                            debug!(error = %e, "inbound item rejected");
                        }
                    }
                }
                Ok(None) => {
                    info!(received = stats.received, "Provider stream ended");
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Provider error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many provider errors, shutting down");
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(
            received = stats.received,
            suppressed = stats.suppressed,
            rejected = stats.rejected,
            "Ingestion task ended"
        );
        stats
    }
}
