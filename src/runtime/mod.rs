use crate::types::{Container, LifecycleEvent};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start monitoring the runtime for container changes.
    /// The running containers are reported first as `Started` events and
    /// closed by a `Synced` marker, then live lifecycle changes follow on
    /// the same channel.  Every reconnect repeats the scan.
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> Result<()>;

    /// Fetch the current metadata of one container.
    async fn inspect(&self, id: &str) -> Result<Container>;

    /// Ids of the currently running containers.
    async fn list(&self) -> Result<Vec<String>>;
}
