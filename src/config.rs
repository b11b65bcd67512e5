use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use hickory_server::proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};

use crate::cloudflare::{Credentials, SyncPolicy, TunnelIds, Zone, ZoneMap};
use crate::dns_server::{RedirectTarget, DEFAULT_TTL};
use crate::error::ConfigError;
use crate::registry::DEFAULT_NETWORK_LABEL;
use crate::resolvers::{
    ComposeResolver, ContainerNameResolver, HostnameLabelResolver, HostnameResolver,
    LabelResolver, NetworkAliasResolver, ResolverChain, TraefikRuleResolver,
};

/// Suffix used by the naming policies when a domain is left empty.
const DEFAULT_DOMAIN: &str = "docker.local";

/// One configured naming policy, in chain order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolverSpec {
    /// `{container-name}.{domain}`
    Name {
        #[serde(default)]
        domain: String,
    },
    /// `{hostname}.{domain}`
    Hostname { domain: String },
    /// `{service}.{project}.{domain}`
    Compose { domain: String },
    /// Aliases of one network, or of all of them.
    NetworkAliases {
        #[serde(default)]
        network: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudflareConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// CNAME target for plain DNS sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub zones: Vec<Zone>,
    pub proxied: bool,
    pub exclude: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub dns_bind: SocketAddr,
    pub docker_endpoint: String,
    pub ttl: u32,
    pub resolvers: Vec<ResolverSpec>,
    pub host_label: String,
    pub network_label: String,
    pub traefik_label_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traefik_cname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traefik_a: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname_target: Option<String>,
    pub hostname_label: String,
    pub tunnel_label: String,
    /// Forwarders for unmatched queries; empty means the system resolv.conf.
    pub upstreams: Vec<SocketAddr>,
    pub cloudflare: CloudflareConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            docker_endpoint: "unix:///var/run/docker.sock".into(),
            ttl: DEFAULT_TTL,
            resolvers: Vec::new(),
            host_label: "coredns.dockerdiscovery.host".into(),
            network_label: DEFAULT_NETWORK_LABEL.into(),
            traefik_label_prefix: "traefik".into(),
            traefik_cname: None,
            traefik_a: None,
            cname_target: None,
            hostname_label: "coredns.dockerdiscovery.hostname".into(),
            tunnel_label: "coredns.dockerdiscovery.tunnel".into(),
            upstreams: Vec::new(),
            cloudflare: CloudflareConfig::default(),
        }
    }
}

/// Validated Cloudflare settings.
#[derive(Debug, Clone)]
pub struct CloudflareSetup {
    pub credentials: Credentials,
    pub policy: SyncPolicy,
    /// Set when plain DNS sync is enabled.
    pub dns_target: Option<String>,
    /// Set when tunnel sync is enabled.
    pub tunnel: Option<TunnelIds>,
}

/// Everything the daemon needs, checked for consistency.
#[derive(Debug)]
pub struct Setup {
    pub dns_bind: SocketAddr,
    pub docker_endpoint: String,
    pub ttl: u32,
    pub upstreams: Vec<SocketAddr>,
    pub chain: ResolverChain,
    pub redirect: Option<RedirectTarget>,
    pub network_label: String,
    pub tunnel_label: String,
    pub traefik_label_prefix: String,
    pub cloudflare: Option<CloudflareSetup>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Config = Self::figment().extract().map_err(Box::new)?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("DOCKER_DNS_CF_TOKEN_FILE") {
            config.cloudflare.token = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }

        Ok(config)
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("docker-dns.toml"))
            .merge(Json::file("docker-dns.json"))
            .merge(Env::prefixed("DOCKER_DNS_").split("__"))
    }

    /// Validates the options and assembles the resolver chain, redirect
    /// target and provider settings.
    pub fn build(self) -> Result<Setup, ConfigError> {
        let traefik_cname = non_empty(self.traefik_cname);
        let cname_target = non_empty(self.cname_target);

        let mut redirect = match (&traefik_cname, self.traefik_a, &cname_target) {
            (Some(_), Some(_), _) => {
                return Err(ConfigError::MutuallyExclusive("traefik_cname", "traefik_a"))
            }
            (_, Some(_), Some(_)) => {
                return Err(ConfigError::MutuallyExclusive("cname_target", "traefik_a"))
            }
            (Some(traefik), None, Some(cname)) if !same_host(traefik, cname) => {
                return Err(ConfigError::ConflictingTargets {
                    cname_target: cname.clone(),
                    traefik_cname: traefik.clone(),
                })
            }
            (Some(host), None, _) | (None, None, Some(host)) => {
                Some(RedirectTarget::Cname(host_name("traefik_cname", host)?))
            }
            (None, Some(ip), None) => Some(RedirectTarget::A(ip)),
            (None, None, None) => None,
        };
        let mut traefik_enabled = traefik_cname.is_some() || self.traefik_a.is_some();

        let cloudflare = self.cloudflare.build()?;
        // Syncing needs redirect domains, so Cloudflare switches the Traefik
        // policy on, pointing at the sync target unless one was configured.
        let auto_target = cloudflare.as_ref().and_then(|cf| {
            cf.dns_target
                .clone()
                .or_else(|| cf.tunnel.as_ref().map(TunnelIds::cname_target))
        });
        if let Some(target) = auto_target.filter(|_| !traefik_enabled) {
            traefik_enabled = true;
            if redirect.is_none() {
                redirect = Some(RedirectTarget::Cname(host_name("cloudflare.target", &target)?));
            }
        }

        let mut chain = ResolverChain::new().with_plain(LabelResolver {
            label: self.host_label,
        });
        for spec in self.resolvers {
            match spec {
                ResolverSpec::Name { domain } => chain.push_plain(ContainerNameResolver {
                    domain: or_default_domain(domain),
                }),
                ResolverSpec::Hostname { domain } => chain.push_plain(HostnameResolver {
                    domain: or_default_domain(domain),
                }),
                ResolverSpec::Compose { domain } => chain.push_plain(ComposeResolver {
                    domain: or_default_domain(domain),
                }),
                ResolverSpec::NetworkAliases { network } => {
                    chain.push_plain(NetworkAliasResolver {
                        network: non_empty(network),
                    })
                }
            }
        }
        if traefik_enabled {
            chain.push_redirect(TraefikRuleResolver::new(self.traefik_label_prefix.clone()));
        }
        if cname_target.is_some() {
            chain.push_redirect(HostnameLabelResolver {
                label: self.hostname_label,
            });
        }

        Ok(Setup {
            dns_bind: self.dns_bind,
            docker_endpoint: self.docker_endpoint,
            ttl: if self.ttl == 0 { DEFAULT_TTL } else { self.ttl },
            upstreams: self.upstreams,
            chain,
            redirect,
            network_label: self.network_label,
            tunnel_label: self.tunnel_label,
            traefik_label_prefix: self.traefik_label_prefix,
            cloudflare,
        })
    }
}

impl CloudflareConfig {
    /// `Ok(None)` when the table is empty; an error naming every missing
    /// key when it is only partly filled.
    pub fn build(self) -> Result<Option<CloudflareSetup>, ConfigError> {
        let token = non_empty(self.token);
        let email = non_empty(self.email);
        let key = non_empty(self.key);
        let target = non_empty(self.target);
        let tunnel_id = non_empty(self.tunnel_id);
        let account_id = non_empty(self.account_id);
        let zones: Vec<Zone> = self
            .zones
            .into_iter()
            .filter(|zone| !zone.domain.is_empty() && !zone.zone_id.is_empty())
            .collect();

        let credentials = match (token, email, key) {
            (Some(token), _, _) => Some(Credentials::Token(token)),
            (None, Some(email), Some(key)) => Some(Credentials::Key { email, key }),
            _ => None,
        };

        let wants_tunnel = tunnel_id.is_some() || account_id.is_some();
        let wants_dns = target.is_some() || (!wants_tunnel && (credentials.is_some() || !zones.is_empty()));
        if !wants_tunnel && !wants_dns {
            return Ok(None);
        }

        let mut missing = Vec::new();
        if credentials.is_none() {
            missing.push("token (or key + email)");
        }
        if wants_dns && target.is_none() {
            missing.push("target");
        }
        if zones.is_empty() {
            missing.push("zones");
        }
        if wants_tunnel && tunnel_id.is_none() {
            missing.push("tunnel_id");
        }
        if wants_tunnel && account_id.is_none() {
            missing.push("account_id");
        }
        let Some(credentials) = credentials.filter(|_| missing.is_empty()) else {
            return Err(ConfigError::IncompleteCloudflare(missing));
        };

        let tunnel = match (tunnel_id, account_id) {
            (Some(tunnel_id), Some(account_id)) => Some(TunnelIds {
                account_id,
                tunnel_id,
            }),
            _ => None,
        };

        Ok(Some(CloudflareSetup {
            credentials,
            policy: SyncPolicy {
                zones: ZoneMap::new(zones),
                exclude: self
                    .exclude
                    .iter()
                    .map(|domain| domain.trim())
                    .filter(|domain| !domain.is_empty())
                    .map(str::to_string)
                    .collect::<HashSet<_>>(),
                proxied: self.proxied,
            },
            dns_target: target,
            tunnel,
        }))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn or_default_domain(domain: String) -> String {
    if domain.is_empty() {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    }
}

fn same_host(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Parses a redirect host as a fully qualified name.
fn host_name(key: &'static str, host: &str) -> Result<Name, ConfigError> {
    Name::from_ascii(format!("{}.", host.trim_end_matches('.'))).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
