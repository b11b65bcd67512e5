use super::ContainerRuntime;
use crate::types::{short_id, Container, LifecycleEvent, NetworkAttachment};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EndpointSettings, EventMessage};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Seconds before a Docker API request times out.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Pause before re-subscribing after the event stream broke.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct DockerRuntime {
    endpoint: String,
    docker: Docker,
}

impl DockerRuntime {
    /// Builds a client for `endpoint` (`unix://`, `tcp://`, `http://`).
    /// No request is made until [`ContainerRuntime::monitor`] pings.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if endpoint.is_empty() {
            Docker::connect_with_local_defaults()?
        } else {
            return Err(anyhow!("unsupported docker endpoint: {}", endpoint));
        };

        Ok(Self {
            endpoint: endpoint.to_string(),
            docker,
        })
    }

    async fn initial_scan(&self, event_tx: &mpsc::Sender<LifecycleEvent>) -> Result<()> {
        let ids = self.list().await?;
        info!("Found {} running containers at startup", ids.len());

        for id in &ids {
            match self.inspect(id).await {
                Ok(container) => {
                    debug!("Inspected container {} ({})", container.name, short_id(id));
                    send(event_tx, LifecycleEvent::Started(container)).await?;
                }
                Err(e) => error!("Failed to inspect container {}: {:#}", short_id(id), e),
            }
        }
        send(event_tx, LifecycleEvent::Synced { running: ids }).await
    }

    /// Turns one Docker event into a lifecycle event, inspecting the
    /// container when its metadata is needed.
    async fn translate(&self, event: EventMessage) -> Option<LifecycleEvent> {
        let actor = event.actor?;
        let action = event.action.unwrap_or_default();
        let kind = event.typ.map(|t| t.to_string()).unwrap_or_default();

        let container_id = match (kind.as_str(), action.as_str()) {
            ("container", "start") | ("container", "die") => actor.id.unwrap_or_default(),
            ("network", "connect") | ("network", "disconnect") => actor
                .attributes
                .as_ref()
                .and_then(|attributes| attributes.get("container").cloned())
                .unwrap_or_default(),
            _ => return None,
        };
        if container_id.is_empty() {
            return None;
        }
        debug!("Received event: {}:{} ({})", kind, action, short_id(&container_id));

        if action == "die" {
            return Some(LifecycleEvent::Stopped { id: container_id });
        }

        match self.inspect(&container_id).await {
            Ok(container) => Some(LifecycleEvent::Started(container)),
            Err(e) => {
                warn!(
                    "Event error {}:{} #{}: {:#}",
                    kind,
                    action,
                    short_id(&container_id),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> Result<()> {
        info!("Connecting to Docker endpoint: {}", self.endpoint);
        if let Err(e) = self.docker.ping().await {
            error!("Cannot ping Docker API at {}: {}", self.endpoint, e);
            error!("If using Podman, ensure the Podman socket is enabled:");
            error!("  rootful: sudo systemctl enable --now podman.socket");
            error!("  rootless: systemctl --user enable --now podman.socket");
            error!("  and mount the socket: -v /run/podman/podman.sock:/var/run/docker.sock");
            return Err(e.into());
        }
        info!("Successfully connected to Docker/Podman API");

        loop {
            // Subscribing from before the scan replays whatever changed while
            // it ran; duplicates are harmless.
            let since = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs().to_string())
                .ok();
            let opts = EventsOptions::<String> {
                since,
                filters: [
                    ("type", ["container", "network"].as_slice()),
                    ("event", ["start", "die", "connect", "disconnect"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            if let Err(e) = self.initial_scan(&event_tx).await {
                if event_tx.is_closed() {
                    return Err(e);
                }
                error!("Failed initial scan: {:#}. Retrying...", e);
                sleep(RECONNECT_DELAY).await;
                continue;
            }
            info!("Startup container scan complete. Listening for events...");

            let mut stream = self.docker.events(Some(opts));

            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) => {
                        if let Some(event) = self.translate(event).await {
                            send(&event_tx, event).await?;
                        }
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn inspect(&self, id: &str) -> Result<Container> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspecting container {}", short_id(id)))?;
        Ok(Container::from(detail))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

async fn send(event_tx: &mpsc::Sender<LifecycleEvent>, event: LifecycleEvent) -> Result<()> {
    event_tx
        .send(event)
        .await
        .map_err(|_| anyhow!("Channel closed"))
}

/// Empty strings are how Docker reports "no address".
fn parse_addr<T: FromStr>(value: Option<&String>) -> Option<T> {
    value
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

impl From<EndpointSettings> for NetworkAttachment {
    fn from(settings: EndpointSettings) -> Self {
        Self {
            ip_address: parse_addr(settings.ip_address.as_ref()),
            global_ipv6_address: parse_addr(settings.global_ipv6_address.as_ref()),
            aliases: settings.aliases.unwrap_or_default(),
        }
    }
}

impl From<ContainerInspectResponse> for Container {
    fn from(detail: ContainerInspectResponse) -> Self {
        let config = detail.config.unwrap_or_default();
        let settings = detail.network_settings.unwrap_or_default();
        let networks: HashMap<String, EndpointSettings> = settings.networks.unwrap_or_default();

        Self {
            id: detail.id.unwrap_or_default(),
            name: detail
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            hostname: config.hostname.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
            network_mode: detail
                .host_config
                .and_then(|host| host.network_mode)
                .unwrap_or_default(),
            ip_address: parse_addr(settings.ip_address.as_ref()),
            global_ipv6_address: parse_addr(settings.global_ipv6_address.as_ref()),
            networks: networks
                .into_iter()
                .map(|(name, endpoint)| (name, NetworkAttachment::from(endpoint)))
                .collect(),
        }
    }
}
