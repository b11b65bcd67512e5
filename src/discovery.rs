//! Background container discovery.
//!
//! The runtime monitor feeds lifecycle events into a bounded channel; this
//! loop drains it and hands each event to its own task so that slow
//! address resolution for one container never holds up the others.
//! A `Synced` marker waits for those tasks before pruning, so a scan's own
//! upserts can never land after the prune they belong to.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::registry::ContainerRegistry;
use crate::runtime::ContainerRuntime;
use crate::types::LifecycleEvent;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Runs until the runtime monitor gives up.  Always returns an error: the
/// monitor only ends when the runtime is unreachable or the channel broke.
/// Entries already in the registry keep being served.
pub async fn run_discovery(
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let monitor = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.monitor(event_tx).await })
    };

    info!("Container discovery started");
    let mut in_flight = JoinSet::new();
    while let Some(event) = event_rx.recv().await {
        while in_flight.try_join_next().is_some() {}

        debug!("Handling {:?}", event);
        if let LifecycleEvent::Synced { .. } = event {
            while in_flight.join_next().await.is_some() {}
            registry.handle(event).await;
            continue;
        }
        let registry = Arc::clone(&registry);
        in_flight.spawn(async move { registry.handle(event).await });
    }
    while in_flight.join_next().await.is_some() {}

    match monitor.await {
        Ok(Ok(())) => Err(anyhow!("container runtime monitor stopped")),
        Ok(Err(e)) => {
            error!("Container runtime failed: {:#}", e);
            Err(e)
        }
        Err(e) => Err(anyhow!("container runtime monitor panicked: {}", e)),
    }
}
