//! Naming policies turning a container into candidate domain names.
//!
//! Every policy implements [`DomainResolver`].  The [`ResolverChain`] runs
//! the plain policies in configured order and concatenates their output;
//! the redirect policies run separately and feed the CNAME side.  Domains
//! are returned without a trailing dot.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;

use crate::error::ResolveError;
use crate::types::Container;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// A single naming policy.
pub trait DomainResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError>;
}

/// `{container-name}.{domain}`
#[derive(Debug, Clone)]
pub struct ContainerNameResolver {
    pub domain: String,
}

impl DomainResolver for ContainerNameResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        let name = container.name.trim_start_matches('/');
        if name.is_empty() {
            return Err(ResolveError::MissingName(container.short_id().to_string()));
        }
        Ok(vec![format!("{}.{}", name, self.domain)])
    }
}

/// `{hostname}.{domain}`
#[derive(Debug, Clone)]
pub struct HostnameResolver {
    pub domain: String,
}

impl DomainResolver for HostnameResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        if container.hostname.is_empty() {
            return Err(ResolveError::MissingHostname(
                container.short_id().to_string(),
            ));
        }
        Ok(vec![format!("{}.{}", container.hostname, self.domain)])
    }
}

/// The value of one label is the whole domain.
#[derive(Debug, Clone)]
pub struct LabelResolver {
    pub label: String,
}

impl DomainResolver for LabelResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        Ok(container
            .label(&self.label)
            .filter(|value| !value.is_empty())
            .map(|value| vec![value.to_string()])
            .unwrap_or_default())
    }
}

/// `{service}.{project}.{domain}` from the compose labels.
#[derive(Debug, Clone)]
pub struct ComposeResolver {
    pub domain: String,
}

impl DomainResolver for ComposeResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        let (Some(project), Some(service)) = (
            container.label(COMPOSE_PROJECT_LABEL),
            container.label(COMPOSE_SERVICE_LABEL),
        ) else {
            return Ok(Vec::new());
        };

        let domain = format!("{}.{}.{}", service, project, self.domain);
        debug!(
            "Found compose domain for container {}: {}",
            container.short_id(),
            domain
        );
        Ok(vec![domain])
    }
}

/// Aliases of one named network, or of every network when unset.
#[derive(Debug, Clone, Default)]
pub struct NetworkAliasResolver {
    pub network: Option<String>,
}

impl DomainResolver for NetworkAliasResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        let domains = match &self.network {
            Some(network) => container
                .networks
                .get(network)
                .map(|attachment| attachment.aliases.clone())
                .unwrap_or_default(),
            None => container
                .networks
                .values()
                .flat_map(|attachment| attachment.aliases.iter().cloned())
                .collect(),
        };
        Ok(domains)
    }
}

/// Extracts `Host(`…`)` and `HostSNI(`…`)` values from Traefik router rules.
#[derive(Debug, Clone)]
pub struct TraefikRuleResolver {
    prefix: String,
}

static HOST_MATCHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Host(?:SNI)?\(`([^`]+)`\)").expect("host matcher pattern is valid")
});

impl TraefikRuleResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Matches `<prefix>.http.routers.<name>.rule`.
    pub fn is_router_rule(&self, label: &str) -> bool {
        label
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(".http.routers."))
            .and_then(|rest| rest.strip_suffix(".rule"))
            .is_some_and(|router| !router.is_empty())
    }
}

impl DomainResolver for TraefikRuleResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        let mut seen = HashSet::new();
        let mut domains = Vec::new();

        for (label, rule) in &container.labels {
            if !self.is_router_rule(label) {
                continue;
            }
            for captures in HOST_MATCHER.captures_iter(rule) {
                let host = captures[1].to_lowercase();
                if seen.insert(host.clone()) {
                    debug!(
                        "Found traefik host for container {}: {}",
                        container.short_id(),
                        host
                    );
                    domains.push(host);
                }
            }
        }

        Ok(domains)
    }
}

/// The value of a hostname label becomes a redirect domain.
#[derive(Debug, Clone)]
pub struct HostnameLabelResolver {
    pub label: String,
}

impl DomainResolver for HostnameLabelResolver {
    fn resolve(&self, container: &Container) -> Result<Vec<String>, ResolveError> {
        Ok(container
            .label(&self.label)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| vec![value.to_lowercase()])
            .unwrap_or_default())
    }
}

/// First non-empty `<prefix>.http.services.<name>.loadbalancer.server.port`.
pub fn traefik_service_port<'a>(container: &'a Container, prefix: &str) -> Option<&'a str> {
    container.labels.iter().find_map(|(label, value)| {
        let service = label
            .strip_prefix(prefix)?
            .strip_prefix(".http.services.")?
            .strip_suffix(".loadbalancer.server.port")?;
        (!service.is_empty() && !value.is_empty()).then_some(value.as_str())
    })
}

/// Domains computed for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDomains {
    /// A/AAAA-eligible names, in policy order, duplicates kept.
    pub plain: Vec<String>,
    /// CNAME-eligible names, deduplicated.
    pub redirect: Vec<String>,
}

impl ResolvedDomains {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.redirect.is_empty()
    }
}

/// Ordered plain policies plus the redirect policies.
#[derive(Debug, Default)]
pub struct ResolverChain {
    plain: Vec<Box<dyn DomainResolver>>,
    redirect: Vec<Box<dyn DomainResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plain(&mut self, resolver: impl DomainResolver + 'static) {
        self.plain.push(Box::new(resolver));
    }

    pub fn push_redirect(&mut self, resolver: impl DomainResolver + 'static) {
        self.redirect.push(Box::new(resolver));
    }

    pub fn with_plain(mut self, resolver: impl DomainResolver + 'static) -> Self {
        self.push_plain(resolver);
        self
    }

    pub fn with_redirect(mut self, resolver: impl DomainResolver + 'static) -> Self {
        self.push_redirect(resolver);
        self
    }

    pub fn plain_len(&self) -> usize {
        self.plain.len()
    }

    pub fn redirect_len(&self) -> usize {
        self.redirect.len()
    }

    /// Runs every policy. A failing policy contributes nothing.
    pub fn resolve(&self, container: &Container) -> ResolvedDomains {
        let mut resolved = ResolvedDomains::default();

        for resolver in &self.plain {
            match resolver.resolve(container) {
                Ok(domains) => resolved.plain.extend(domains),
                Err(e) => warn!("Error resolving container domains: {}", e),
            }
        }

        let mut seen = HashSet::new();
        for resolver in &self.redirect {
            match resolver.resolve(container) {
                Ok(domains) => resolved
                    .redirect
                    .extend(domains.into_iter().filter(|d| seen.insert(d.clone()))),
                Err(e) => warn!("Error resolving redirect domains: {}", e),
            }
        }

        resolved
    }
}
