//! Public hostname routes on a Cloudflare Tunnel.
//!
//! The ingress list is a single remote resource shared by every container,
//! so each change is a GET → edit → PUT of the whole list.  The mutex in
//! [`TunnelSyncer`] only serializes writers inside this process; edits made
//! concurrently through the dashboard or another tool still race and the
//! last PUT wins.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use super::dns_sync::{CnameOutcome, CnameWriter};
use super::{DnsRecordApi, IngressRule, SyncPolicy, TunnelConfigApi, TunnelConfiguration};

/// Identifies one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIds {
    pub account_id: String,
    pub tunnel_id: String,
}

impl TunnelIds {
    /// Hostname every routed domain is CNAMEd to.
    pub fn cname_target(&self) -> String {
        format!("{}.cfargotunnel.com", self.tunnel_id)
    }
}

pub struct TunnelSyncer {
    tunnels: Arc<dyn TunnelConfigApi>,
    records: CnameWriter,
    ids: TunnelIds,
    exclude: HashSet<String>,
    lock: Mutex<()>,
}

impl TunnelSyncer {
    pub fn new(
        tunnels: Arc<dyn TunnelConfigApi>,
        records: Arc<dyn DnsRecordApi>,
        policy: &SyncPolicy,
        ids: TunnelIds,
    ) -> Self {
        Self {
            tunnels,
            records: CnameWriter::new(records, policy),
            ids,
            exclude: policy.exclude.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn ids(&self) -> &TunnelIds {
        &self.ids
    }

    fn wanted<'a>(&self, hostnames: &'a [String]) -> Vec<&'a str> {
        hostnames
            .iter()
            .map(String::as_str)
            .filter(|hostname| !hostname.is_empty())
            .filter(|hostname| {
                let excluded = self.exclude.contains(*hostname);
                if excluded {
                    debug!("Skipping excluded domain: {}", hostname);
                }
                !excluded
            })
            .collect()
    }

    /// Routes every non-excluded hostname to `service`, then points its
    /// CNAME at the tunnel.
    pub async fn add_routes(&self, hostnames: &[String], service: &str) {
        let hostnames = self.wanted(hostnames);
        if hostnames.is_empty() {
            return;
        }

        let _guard = self.lock.lock().await;

        let mut config = match self.fetch().await {
            Some(config) => config,
            None => return,
        };

        let modified = apply_routes(&mut config.ingress, &hostnames, service);
        if modified && !self.push(&config).await {
            return;
        }

        let target = self.ids.cname_target();
        for hostname in hostnames {
            match self.records.upsert(hostname, &target).await {
                Ok(CnameOutcome::NoZone) => warn!("No zone found for domain: {}", hostname),
                Ok(CnameOutcome::Created) | Ok(CnameOutcome::Updated) => {
                    info!("Tunnel DNS record for {} -> {}", hostname, target)
                }
                Ok(_) => {}
                Err(e) => warn!("Error upserting tunnel DNS record for {}: {}", hostname, e),
            }
        }
    }

    /// Drops the routes of every non-excluded hostname and deletes their
    /// CNAMEs.  The catch-all is never removed.
    pub async fn remove_routes(&self, hostnames: &[String]) {
        let hostnames = self.wanted(hostnames);
        if hostnames.is_empty() {
            return;
        }

        let _guard = self.lock.lock().await;

        let mut config = match self.fetch().await {
            Some(config) => config,
            None => return,
        };

        let before = config.ingress.len();
        config.ingress.retain(|rule| {
            let drop = !rule.is_catch_all() && hostnames.contains(&rule.hostname.as_str());
            if drop {
                info!("Removing tunnel route for {}", rule.hostname);
            }
            !drop
        });

        if config.ingress.len() != before && !self.push(&config).await {
            return;
        }

        for hostname in hostnames {
            if let Err(e) = self.records.delete(hostname).await {
                warn!("Error deleting tunnel DNS record for {}: {}", hostname, e);
            }
        }
    }

    async fn fetch(&self) -> Option<TunnelConfiguration> {
        match self
            .tunnels
            .get_tunnel_config(&self.ids.account_id, &self.ids.tunnel_id)
            .await
        {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Error getting tunnel configuration: {}", e);
                None
            }
        }
    }

    async fn push(&self, config: &TunnelConfiguration) -> bool {
        match self
            .tunnels
            .put_tunnel_config(&self.ids.account_id, &self.ids.tunnel_id, config)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!("Error updating tunnel configuration: {}", e);
                false
            }
        }
    }
}

/// Inserts or retargets a rule per hostname, keeping exactly one
/// catch-all as the last rule.  Returns whether anything changed.
fn apply_routes(ingress: &mut Vec<IngressRule>, hostnames: &[&str], service: &str) -> bool {
    let well_formed = ingress.iter().filter(|rule| rule.is_catch_all()).count() == 1
        && ingress.last().is_some_and(|rule| rule.is_catch_all());
    let mut modified = !well_formed;
    if modified {
        warn!("Tunnel ingress has a misplaced or missing catch-all rule, repairing");
    }

    let catch_all = ingress
        .iter()
        .position(|rule| rule.is_catch_all())
        .map(|at| ingress.remove(at))
        .unwrap_or_else(IngressRule::catch_all);
    ingress.retain(|rule| !rule.is_catch_all());

    for hostname in hostnames {
        if let Some(rule) = ingress.iter_mut().find(|rule| rule.hostname == *hostname) {
            if rule.service != service {
                info!("Updating tunnel route for {} -> {}", hostname, service);
                rule.service = service.to_string();
                modified = true;
            } else {
                debug!("Route for {} already up to date", hostname);
            }
            continue;
        }

        info!("Adding tunnel route for {} -> {}", hostname, service);
        ingress.push(IngressRule::new(*hostname, service));
        modified = true;
    }

    ingress.push(catch_all);
    modified
}
