//! CNAME record reconciliation against provider zones.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};

use super::{DnsRecord, DnsRecordApi, RecordFilter, SyncPolicy, ZoneMap, CNAME};
use crate::error::ProviderError;

/// What an upsert or delete did to the remote zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnameOutcome {
    Created,
    Updated,
    Unchanged,
    Deleted(usize),
    /// No configured zone contains the domain; nothing was sent.
    NoZone,
}

/// Idempotent CNAME writes, routed to the most specific zone.
///
/// Nothing is cached: every call re-lists the records for the name.
#[derive(Clone)]
pub struct CnameWriter {
    api: Arc<dyn DnsRecordApi>,
    zones: ZoneMap,
    proxied: bool,
}

impl CnameWriter {
    pub fn new(api: Arc<dyn DnsRecordApi>, policy: &SyncPolicy) -> Self {
        Self {
            api,
            zones: policy.zones.clone(),
            proxied: policy.proxied,
        }
    }

    /// Points `domain` at `target`, creating or updating in place.
    ///
    /// When several records share the name the first one listed is the
    /// one compared and updated.
    pub async fn upsert(&self, domain: &str, target: &str) -> Result<CnameOutcome, ProviderError> {
        let Some(zone_id) = self.zones.find(domain) else {
            return Ok(CnameOutcome::NoZone);
        };

        let existing = self
            .api
            .list_records(zone_id, &RecordFilter::cname(domain))
            .await?;

        let record = DnsRecord {
            id: String::new(),
            record_type: CNAME.to_string(),
            name: domain.to_string(),
            content: target.to_string(),
            proxied: Some(self.proxied),
            ttl: 1,
        };

        match existing.first() {
            Some(current) if current.content == target => Ok(CnameOutcome::Unchanged),
            Some(current) => {
                self.api.update_record(zone_id, &current.id, &record).await?;
                Ok(CnameOutcome::Updated)
            }
            None => {
                self.api.create_record(zone_id, &record).await?;
                Ok(CnameOutcome::Created)
            }
        }
    }

    /// Deletes every CNAME record named `domain`. Absence is not an error.
    pub async fn delete(&self, domain: &str) -> Result<CnameOutcome, ProviderError> {
        let Some(zone_id) = self.zones.find(domain) else {
            return Ok(CnameOutcome::NoZone);
        };

        let existing = self
            .api
            .list_records(zone_id, &RecordFilter::cname(domain))
            .await?;

        for record in &existing {
            debug!("Deleting CNAME record for {} (ID: {})", domain, record.id);
            self.api.delete_record(zone_id, &record.id).await?;
        }
        Ok(CnameOutcome::Deleted(existing.len()))
    }
}

/// Keeps redirect domains published as CNAMEs to one fixed target.
pub struct ExternalDnsSync {
    writer: CnameWriter,
    target: String,
    exclude: HashSet<String>,
}

impl ExternalDnsSync {
    pub fn new(api: Arc<dyn DnsRecordApi>, policy: &SyncPolicy, target: impl Into<String>) -> Self {
        Self {
            writer: CnameWriter::new(api, policy),
            target: target.into(),
            exclude: policy.exclude.clone(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Creates or updates a CNAME per non-excluded domain. Per-domain
    /// failures are logged and do not stop the batch.
    pub async fn sync_domains(&self, domains: &[String]) {
        for domain in domains {
            if self.exclude.contains(domain) {
                debug!("Skipping excluded domain: {}", domain);
                continue;
            }

            match self.writer.upsert(domain, &self.target).await {
                Ok(CnameOutcome::NoZone) => warn!("No zone found for domain: {}", domain),
                Ok(CnameOutcome::Unchanged) => {
                    debug!("Record for {} already up to date", domain)
                }
                Ok(CnameOutcome::Updated) => {
                    info!("Updated CNAME record for {} -> {}", domain, self.target)
                }
                Ok(_) => info!("Created CNAME record for {} -> {}", domain, self.target),
                Err(e) => warn!("Error syncing domain {}: {}", domain, e),
            }
        }
    }

    /// Deletes the CNAMEs of every non-excluded domain.
    pub async fn remove_domains(&self, domains: &[String]) {
        for domain in domains {
            if self.exclude.contains(domain) {
                continue;
            }

            match self.writer.delete(domain).await {
                Ok(CnameOutcome::NoZone) => warn!("No zone found for domain: {}", domain),
                Ok(CnameOutcome::Deleted(count)) if count > 0 => {
                    info!("Removed {} CNAME record(s) for {}", count, domain)
                }
                Ok(_) => debug!("No CNAME record to remove for {}", domain),
                Err(e) => warn!("Error removing domain {}: {}", domain, e),
            }
        }
    }
}
