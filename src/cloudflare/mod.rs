//! Cloudflare DNS and tunnel reconciliation.
//!
//! The provider is reached through two capability traits so the syncers
//! can be exercised against an in-memory double:
//!
//! * [`DnsRecordApi`]: list/create/update/delete DNS records in a zone.
//! * [`TunnelConfigApi`]: GET/PUT the full configuration of a tunnel.
//!
//! [`CloudflareClient`] implements both against the v4 REST API.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub mod client;
pub mod dns_sync;
pub mod tunnel;

pub use client::{CloudflareClient, Credentials};
pub use dns_sync::{CnameOutcome, CnameWriter, ExternalDnsSync};
pub use tunnel::{TunnelIds, TunnelSyncer};

pub const CNAME: &str = "CNAME";

/// Service of the synthesized catch-all ingress rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// A DNS record as the provider stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxied: Option<bool>,
    /// 1 means "automatic".
    #[serde(default)]
    pub ttl: u32,
}

/// Server-side filter for [`DnsRecordApi::list_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub record_type: String,
    pub name: String,
}

impl RecordFilter {
    pub fn cname(name: &str) -> Self {
        Self {
            record_type: CNAME.to_string(),
            name: name.to_string(),
        }
    }
}

/// One public hostname rule of a tunnel.  An empty hostname is the
/// catch-all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_request: Option<serde_json::Value>,
}

impl IngressRule {
    pub fn new(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn catch_all() -> Self {
        Self::new("", CATCH_ALL_SERVICE)
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_empty()
    }
}

/// The remotely managed configuration of a tunnel.  Only `ingress` is
/// edited; the other sections are passed back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_request: Option<serde_json::Value>,
    #[serde(
        rename = "warp-routing",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub warp_routing: Option<serde_json::Value>,
}

#[async_trait]
pub trait DnsRecordApi: Send + Sync {
    async fn list_records(
        &self,
        zone_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<DnsRecord>, ProviderError>;

    async fn create_record(
        &self,
        zone_id: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError>;

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &DnsRecord,
    ) -> Result<(), ProviderError>;

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait TunnelConfigApi: Send + Sync {
    async fn get_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<TunnelConfiguration, ProviderError>;

    async fn put_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
        config: &TunnelConfiguration,
    ) -> Result<TunnelConfiguration, ProviderError>;
}

/// A domain suffix served by one provider zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub domain: String,
    pub zone_id: String,
}

/// Configured zones, routed by longest matching suffix.
#[derive(Debug, Clone, Default)]
pub struct ZoneMap {
    zones: Vec<Zone>,
}

impl ZoneMap {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self { zones }
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Zone id of the most specific zone containing `domain`.
    pub fn find(&self, domain: &str) -> Option<&str> {
        self.zones
            .iter()
            .filter(|zone| in_zone(domain, &zone.domain))
            .fold(None::<&Zone>, |best, zone| match best {
                Some(b) if b.domain.len() >= zone.domain.len() => Some(b),
                _ => Some(zone),
            })
            .map(|zone| zone.zone_id.as_str())
    }
}

fn in_zone(domain: &str, suffix: &str) -> bool {
    domain == suffix
        || domain
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.'))
}

/// Settings shared by both syncers.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicy {
    pub zones: ZoneMap,
    pub exclude: HashSet<String>,
    pub proxied: bool,
}

impl SyncPolicy {
    pub fn is_excluded(&self, domain: &str) -> bool {
        self.exclude.contains(domain)
    }
}
