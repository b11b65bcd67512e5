//! Hands redirect domains to the external provider.
//!
//! Each container's redirect domains go either through the tunnel or
//! through plain CNAME sync, never both.  The work implied by one registry
//! change runs in order on a single spawned task and is never reported back: failures end in a log line, and there
//! is no retry or outbox.  Callers must not hold the registry lock while
//! dispatching.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, warn};

use crate::cloudflare::{ExternalDnsSync, TunnelSyncer};
use crate::resolvers::traefik_service_port;
use crate::types::Container;

/// Port assumed for tunnelled containers without a Traefik service port.
const DEFAULT_SERVICE_PORT: &str = "80";

/// Which remote path a container's redirect domains were published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRoute {
    Dns,
    Tunnel { service: String },
}

impl SyncRoute {
    /// Whether publishing along `other` overwrites what was published
    /// along `self`.  A tunnel route retargets its rules in place, so a
    /// changed service is not a different path.
    pub fn same_path(&self, other: &SyncRoute) -> bool {
        matches!(
            (self, other),
            (SyncRoute::Dns, SyncRoute::Dns) | (SyncRoute::Tunnel { .. }, SyncRoute::Tunnel { .. })
        )
    }
}

/// A unit of remote work produced by a registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTask {
    Publish { route: SyncRoute, domains: Vec<String> },
    Retract { route: SyncRoute, domains: Vec<String> },
}

pub struct Reconciler {
    dns: Option<Arc<ExternalDnsSync>>,
    tunnel: Option<Arc<TunnelSyncer>>,
    tunnel_label: String,
    traefik_prefix: String,
}

impl Reconciler {
    pub fn new(tunnel_label: impl Into<String>, traefik_prefix: impl Into<String>) -> Self {
        Self {
            dns: None,
            tunnel: None,
            tunnel_label: tunnel_label.into(),
            traefik_prefix: traefik_prefix.into(),
        }
    }

    /// No remote sync at all.
    pub fn disabled() -> Self {
        Self::new("", "")
    }

    pub fn with_dns(mut self, dns: Arc<ExternalDnsSync>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_tunnel(mut self, tunnel: Arc<TunnelSyncer>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.dns.is_some() || self.tunnel.is_some()
    }

    /// Picks the remote path for a container, or `None` when it must not
    /// be synced.
    pub fn route_for(&self, container: &Container, ipv4: Option<Ipv4Addr>) -> Option<SyncRoute> {
        let opted_out = container
            .label(&self.tunnel_label)
            .is_some_and(|value| value.eq_ignore_ascii_case("false"));

        if self.tunnel.is_some() && !opted_out {
            let explicit = format!("{}.service", self.tunnel_label);
            if let Some(service) = container.label(&explicit).filter(|s| !s.is_empty()) {
                return Some(SyncRoute::Tunnel {
                    service: service.to_string(),
                });
            }
            let Some(ip) = ipv4 else {
                warn!(
                    "Container {} ({}) has no IPv4 address or {} label, not routing through the tunnel",
                    container.name,
                    container.short_id(),
                    explicit
                );
                return None;
            };
            let port = traefik_service_port(container, &self.traefik_prefix)
                .unwrap_or(DEFAULT_SERVICE_PORT);
            return Some(SyncRoute::Tunnel {
                service: format!("http://{}:{}", ip, port),
            });
        }

        self.dns.as_ref().map(|_| SyncRoute::Dns)
    }

    /// Runs `tasks` in order on one spawned task; returns immediately.
    pub fn dispatch(&self, tasks: Vec<SyncTask>) {
        if tasks.is_empty() {
            return;
        }
        let dns = self.dns.clone();
        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            for task in tasks {
                run(dns.as_deref(), tunnel.as_deref(), task).await;
            }
        });
    }
}

async fn run(dns: Option<&ExternalDnsSync>, tunnel: Option<&TunnelSyncer>, task: SyncTask) {
    debug!("Dispatching {:?}", task);
    match (task, dns, tunnel) {
        (
            SyncTask::Publish {
                route: SyncRoute::Dns,
                domains,
            },
            Some(dns),
            _,
        ) => dns.sync_domains(&domains).await,
        (
            SyncTask::Retract {
                route: SyncRoute::Dns,
                domains,
            },
            Some(dns),
            _,
        ) => dns.remove_domains(&domains).await,
        (
            SyncTask::Publish {
                route: SyncRoute::Tunnel { service },
                domains,
            },
            _,
            Some(tunnel),
        ) => tunnel.add_routes(&domains, &service).await,
        (
            SyncTask::Retract {
                route: SyncRoute::Tunnel { .. },
                domains,
            },
            _,
            Some(tunnel),
        ) => tunnel.remove_routes(&domains).await,
        (task, _, _) => debug!("No syncer configured for {:?}", task),
    }
}

/// Remote work implied by replacing `old` with `new` for one container.
///
/// Domains that vanished, or every old domain when the path changed, are
/// retracted along the old route before the current set is (re)published
/// along the new one, which is idempotent remotely.
pub fn plan(
    old: Option<(&SyncRoute, &[String])>,
    new: Option<(&SyncRoute, &[String])>,
) -> Vec<SyncTask> {
    let mut tasks = Vec::new();

    if let Some((old_route, old_domains)) = old {
        let stale: Vec<String> = match new {
            Some((new_route, new_domains)) if new_route.same_path(old_route) => old_domains
                .iter()
                .filter(|d| !new_domains.contains(*d))
                .cloned()
                .collect(),
            _ => old_domains.to_vec(),
        };
        if !stale.is_empty() {
            tasks.push(SyncTask::Retract {
                route: old_route.clone(),
                domains: stale,
            });
        }
    }

    if let Some((route, domains)) = new {
        if !domains.is_empty() {
            tasks.push(SyncTask::Publish {
                route: route.clone(),
                domains: domains.to_vec(),
            });
        }
    }

    tasks
}
