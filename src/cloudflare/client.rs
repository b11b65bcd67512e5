//! Thin Cloudflare v4 REST client.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{DnsRecord, DnsRecordApi, RecordFilter, TunnelConfigApi, TunnelConfiguration};
use crate::error::ProviderError;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// How requests are authenticated.
#[derive(Clone)]
pub enum Credentials {
    /// Scoped API token (preferred).
    Token(String),
    /// Legacy global API key.
    Key { email: String, key: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(..)"),
            Credentials::Key { email, .. } => write!(f, "Key {{ email: {email}, .. }}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TunnelConfigurationResult {
    #[serde(default)]
    config: Option<TunnelConfiguration>,
}

#[derive(Serialize)]
struct TunnelConfigurationBody<'a> {
    config: &'a TunnelConfiguration,
}

#[derive(Clone)]
pub struct CloudflareClient {
    http: reqwest::Client,
    credentials: Credentials,
    base: String,
}

impl CloudflareClient {
    pub fn new(credentials: Credentials) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("docker-dns/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            credentials,
            base: API_BASE.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match &self.credentials {
            Credentials::Token(token) => builder.bearer_auth(token),
            Credentials::Key { email, key } => builder
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", key),
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>, ProviderError> {
        let response = builder.send().await?;
        let status = response.status();
        let envelope: Envelope<T> = response.json().await?;

        if !status.is_success() || !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl DnsRecordApi for CloudflareClient {
    async fn list_records(
        &self,
        zone_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<DnsRecord>, ProviderError> {
        let builder = self
            .request(Method::GET, &format!("/zones/{}/dns_records", zone_id))
            .query(&[("type", &filter.record_type), ("name", &filter.name)]);
        Ok(self.send(builder).await?.unwrap_or_default())
    }

    async fn create_record(
        &self,
        zone_id: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError> {
        let builder = self
            .request(Method::POST, &format!("/zones/{}/dns_records", zone_id))
            .json(record);
        self.send(builder).await?.ok_or(ProviderError::MissingResult)
    }

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &DnsRecord,
    ) -> Result<(), ProviderError> {
        let builder = self
            .request(
                Method::PUT,
                &format!("/zones/{}/dns_records/{}", zone_id, record_id),
            )
            .json(record);
        self.send::<DnsRecord>(builder).await?;
        Ok(())
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), ProviderError> {
        let builder = self.request(
            Method::DELETE,
            &format!("/zones/{}/dns_records/{}", zone_id, record_id),
        );
        self.send::<serde_json::Value>(builder).await?;
        Ok(())
    }
}

#[async_trait]
impl TunnelConfigApi for CloudflareClient {
    async fn get_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<TunnelConfiguration, ProviderError> {
        let builder = self.request(
            Method::GET,
            &format!(
                "/accounts/{}/cfd_tunnel/{}/configurations",
                account_id, tunnel_id
            ),
        );
        let result: Option<TunnelConfigurationResult> = self.send(builder).await?;
        Ok(result.and_then(|r| r.config).unwrap_or_default())
    }

    async fn put_tunnel_config(
        &self,
        account_id: &str,
        tunnel_id: &str,
        config: &TunnelConfiguration,
    ) -> Result<TunnelConfiguration, ProviderError> {
        let builder = self
            .request(
                Method::PUT,
                &format!(
                    "/accounts/{}/cfd_tunnel/{}/configurations",
                    account_id, tunnel_id
                ),
            )
            .json(&TunnelConfigurationBody { config });
        let result: Option<TunnelConfigurationResult> = self.send(builder).await?;
        result
            .and_then(|r| r.config)
            .ok_or(ProviderError::MissingResult)
    }
}
