//! docker-dns daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use docker_dns::cloudflare::{CloudflareClient, ExternalDnsSync, TunnelSyncer};
use docker_dns::config::{CloudflareSetup, Config};
use docker_dns::discovery::run_discovery;
use docker_dns::dns_server::{run_dns_server, DockerDns, Forwarder};
use docker_dns::reconcile::Reconciler;
use docker_dns::registry::ContainerRegistry;
use docker_dns::runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load and validate configuration
    let setup = Config::load()?.build()?;
    info!(
        "Starting docker-dns on {} (docker: {}, ttl: {}, redirect: {:?})",
        setup.dns_bind, setup.docker_endpoint, setup.ttl, setup.redirect
    );

    // Remote sync
    let mut reconciler = Reconciler::new(setup.tunnel_label, setup.traefik_label_prefix);
    if let Some(cloudflare) = setup.cloudflare {
        reconciler = with_cloudflare(reconciler, cloudflare)?;
    }

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(&setup.docker_endpoint)?);
    let registry = Arc::new(
        ContainerRegistry::new(setup.chain, Arc::clone(&runtime), reconciler)
            .with_network_label(setup.network_label),
    );

    let registry_for_discovery = Arc::clone(&registry);
    let discovery_handle = tokio::spawn(async move {
        if let Err(e) = run_discovery(runtime, registry_for_discovery).await {
            error!("Container discovery stopped: {:#}", e);
        }
    });

    // DNS Server
    let handler = DockerDns::new(
        registry,
        setup.ttl,
        setup.redirect,
        Forwarder::new(&setup.upstreams)?,
    );
    let dns_bind = setup.dns_bind;
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = run_dns_server(dns_bind, handler).await {
            error!("DNS server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    discovery_handle.abort();
    dns_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

fn with_cloudflare(mut reconciler: Reconciler, cloudflare: CloudflareSetup) -> anyhow::Result<Reconciler> {
    let client = Arc::new(CloudflareClient::new(cloudflare.credentials)?);

    if let Some(target) = cloudflare.dns_target {
        info!("Cloudflare DNS sync enabled, target {}", target);
        reconciler = reconciler.with_dns(Arc::new(ExternalDnsSync::new(
            client.clone(),
            &cloudflare.policy,
            target,
        )));
    }
    if let Some(ids) = cloudflare.tunnel {
        info!("Cloudflare tunnel sync enabled, tunnel {}", ids.tunnel_id);
        reconciler = reconciler.with_tunnel(Arc::new(TunnelSyncer::new(
            client.clone(),
            client,
            &cloudflare.policy,
            ids,
        )));
    }
    Ok(reconciler)
}
