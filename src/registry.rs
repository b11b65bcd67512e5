//! The container registry.
//!
//! Maps container ids to the domains they answer for.  Writers (start and
//! stop handling) take the lock exclusively; DNS lookups share it.  Remote
//! reconciliation is planned under the lock but dispatched only after it
//! has been released, so provider latency never blocks DNS answers.
//!
//! Two events for the same container may be handled concurrently; the
//! last one to take the write lock wins, which can differ from the order
//! in which the runtime reported them.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::error::AddressError;
use crate::reconcile::{self, Reconciler, SyncRoute};
use crate::resolvers::ResolverChain;
use crate::runtime::ContainerRuntime;
use crate::types::{short_id, Container, LifecycleEvent, NetworkAttachment};

/// Label selecting which attached network provides the address.
pub const DEFAULT_NETWORK_LABEL: &str = "coredns.dockerdiscovery.network";

/// Bound on `container:<id>` indirections followed for one address.
const MAX_NAMESPACE_HOPS: usize = 8;

/// What the registry knows about one running container.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub container: Container,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// Names answered with the container's own address.
    pub domains: Vec<String>,
    /// Names answered with the redirect target.
    pub redirect_domains: Vec<String>,
    /// Where the redirect domains were published, if anywhere.
    pub route: Option<SyncRoute>,
    generation: u64,
}

impl RegistryEntry {
    fn matches(&self, name: &str, redirect: bool) -> bool {
        let domains = if redirect {
            &self.redirect_domains
        } else {
            &self.domains
        };
        domains.iter().any(|domain| same_name(domain, name))
    }

    fn synced(&self) -> Option<(&SyncRoute, &[String])> {
        self.route
            .as_ref()
            .map(|route| (route, self.redirect_domains.as_slice()))
    }
}

/// A registry hit for one queried name.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub entry: Arc<RegistryEntry>,
    pub is_redirect: bool,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Arc<RegistryEntry>>,
    generation: u64,
}

pub struct ContainerRegistry {
    chain: ResolverChain,
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Reconciler,
    network_label: String,
    inner: RwLock<RegistryInner>,
}

#[derive(Clone, Copy, Debug)]
enum Family {
    V4,
    V6,
}

impl ContainerRegistry {
    pub fn new(
        chain: ResolverChain,
        runtime: Arc<dyn ContainerRuntime>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            chain,
            runtime,
            reconciler,
            network_label: DEFAULT_NETWORK_LABEL.to_string(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn with_network_label(mut self, label: impl Into<String>) -> Self {
        self.network_label = label.into();
        self
    }

    pub async fn handle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Started(container) => self.upsert(container).await,
            LifecycleEvent::Stopped { id } => self.remove(&id).await,
            LifecycleEvent::Synced { running } => self.retain_running(&running).await,
        }
    }

    /// Removes every entry whose container is not in `running`.
    pub async fn retain_running(&self, running: &[String]) {
        let stale: Vec<String> = self
            .inner
            .read()
            .await
            .entries
            .keys()
            .filter(|id| !running.contains(id))
            .cloned()
            .collect();
        for id in stale {
            info!("Container {} stopped while unobserved", short_id(&id));
            self.remove(&id).await;
        }
    }

    /// Recomputes the entry for a started (or reconnected) container,
    /// replacing whatever was stored for it.
    pub async fn upsert(&self, container: Container) {
        let resolved = self.chain.resolve(&container);

        let (mut ipv4, mut ipv6) = (None, None);
        if !resolved.is_empty() {
            match self.resolve_ipv4(&container).await {
                Ok(Some(v4)) => {
                    ipv4 = Some(v4);
                    ipv6 = self.resolve_ipv6(&container).await.unwrap_or_else(|e| {
                        debug!("No IPv6 address for {}: {}", container.short_id(), e);
                        None
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Could not resolve IP for container {} ({}): {}",
                    container.name,
                    container.short_id(),
                    e
                ),
            }
        }

        let mut domains = resolved.plain;
        if ipv4.is_none() && !domains.is_empty() {
            warn!(
                "Dropping A/AAAA domains for container {} ({}): no IP address available",
                container.name,
                container.short_id()
            );
            domains.clear();
        }
        let redirect_domains = resolved.redirect;

        let route = if redirect_domains.is_empty() {
            None
        } else {
            self.reconciler.route_for(&container, ipv4)
        };

        let tasks = {
            let mut inner = self.inner.write().await;
            let previous = inner.entries.remove(&container.id);

            if domains.is_empty() && redirect_domains.is_empty() {
                if previous.is_some() {
                    info!(
                        "Remove container entry {} ({})",
                        container.name,
                        container.short_id()
                    );
                }
                reconcile::plan(previous.as_deref().and_then(RegistryEntry::synced), None)
            } else {
                inner.generation += 1;
                let entry = Arc::new(RegistryEntry {
                    ipv4,
                    ipv6,
                    domains,
                    redirect_domains,
                    route,
                    generation: inner.generation,
                    container,
                });

                if previous.is_none() {
                    if let Some(ip) = entry.ipv4 {
                        info!(
                            "Add entry of container {} ({}). IP: {}",
                            entry.container.name,
                            entry.container.short_id(),
                            ip
                        );
                    }
                    if !entry.redirect_domains.is_empty() {
                        info!(
                            "Add CNAME entries for container {} ({}): {:?}",
                            entry.container.name,
                            entry.container.short_id(),
                            entry.redirect_domains
                        );
                    }
                }

                let tasks = reconcile::plan(
                    previous.as_deref().and_then(RegistryEntry::synced),
                    entry.synced(),
                );
                inner
                    .entries
                    .insert(entry.container.id.clone(), Arc::clone(&entry));
                tasks
            }
        };

        self.reconciler.dispatch(tasks);
    }

    /// Forgets a stopped container and retracts its published domains.
    pub async fn remove(&self, id: &str) {
        let removed = self.inner.write().await.entries.remove(id);

        let Some(entry) = removed else {
            debug!("No entry associated with the container {}", short_id(id));
            return;
        };
        info!(
            "Deleting entry {} ({})",
            entry.container.name,
            entry.container.short_id()
        );
        self.reconciler
            .dispatch(reconcile::plan(entry.synced(), None));
    }

    /// Finds the entry answering for `name` (trailing dot optional).
    ///
    /// Redirect domains take precedence over plain ones across all
    /// entries; among several entries of the same kind the most recently
    /// written wins.
    pub async fn lookup_by_name(&self, name: &str) -> Option<LookupResult> {
        let name = name.strip_suffix('.').unwrap_or(name);
        let inner = self.inner.read().await;

        let newest = |redirect: bool| {
            inner
                .entries
                .values()
                .filter(|entry| entry.matches(name, redirect))
                .max_by_key(|entry| entry.generation)
                .cloned()
        };

        newest(true)
            .map(|entry| LookupResult {
                entry,
                is_redirect: true,
            })
            .or_else(|| {
                newest(false).map(|entry| LookupResult {
                    entry,
                    is_redirect: false,
                })
            })
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RegistryEntry>> {
        self.inner.read().await.entries.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The container's primary IPv4 address, following `container:<id>`
    /// network modes.  `Ok(None)` means there is legitimately none (host
    /// networking, empty address).
    pub async fn resolve_ipv4(&self, container: &Container) -> Result<Option<Ipv4Addr>, AddressError> {
        Ok(match self.address(container, Family::V4).await? {
            Some(IpAddr::V4(ip)) => Some(ip),
            _ => None,
        })
    }

    /// Same walk as [`Self::resolve_ipv4`] for the global IPv6 address.
    pub async fn resolve_ipv6(&self, container: &Container) -> Result<Option<Ipv6Addr>, AddressError> {
        Ok(match self.address(container, Family::V6).await? {
            Some(IpAddr::V6(ip)) => Some(ip),
            _ => None,
        })
    }

    async fn address(
        &self,
        container: &Container,
        family: Family,
    ) -> Result<Option<IpAddr>, AddressError> {
        // The selector is read from the original container only.
        let selector = container.label(&self.network_label).map(str::to_owned);
        let mut current = Cow::Borrowed(container);

        for _ in 0..=MAX_NAMESPACE_HOPS {
            if selector.is_none() {
                let top_level = match family {
                    Family::V4 => current.ip_address.map(IpAddr::V4),
                    Family::V6 => current.global_ipv6_address.map(IpAddr::V6),
                };
                if top_level.is_some() {
                    return Ok(top_level);
                }
            }

            if current.uses_host_network() {
                debug!("Container {} uses host network", current.short_id());
                return Ok(None);
            }

            let Some(owner) = current.namespace_owner().map(str::to_owned) else {
                let network = select_network(&current, selector.as_deref())?;
                return Ok(match family {
                    Family::V4 => network.ip_address.map(IpAddr::V4),
                    Family::V6 => network.global_ipv6_address.map(IpAddr::V6),
                });
            };

            debug!(
                "Container {} is in another container's network namespace",
                current.short_id()
            );
            let other = self
                .runtime
                .inspect(&owner)
                .await
                .map_err(|source| AddressError::Inspect {
                    id: owner.clone(),
                    source,
                })?;
            current = Cow::Owned(other);
        }

        Err(AddressError::NamespaceLoop(MAX_NAMESPACE_HOPS))
    }
}

fn select_network<'a>(
    container: &'a Container,
    selector: Option<&str>,
) -> Result<&'a NetworkAttachment, AddressError> {
    match selector {
        Some(name) => {
            debug!("network name {} specified ({})", name, container.short_id());
            container
                .networks
                .get(name)
                .ok_or_else(|| AddressError::SelectedNetworkMissing(name.to_string()))
        }
        None if container.networks.len() == 1 => container
            .networks
            .values()
            .next()
            .ok_or_else(|| AddressError::NoNetwork {
                network_mode: container.network_mode.clone(),
            }),
        None => Err(AddressError::NoNetwork {
            network_mode: container.network_mode.clone(),
        }),
    }
}

/// Case-insensitive comparison ignoring one trailing dot on either side.
fn same_name(domain: &str, name: &str) -> bool {
    domain
        .strip_suffix('.')
        .unwrap_or(domain)
        .eq_ignore_ascii_case(name)
}
