//! Error types for docker-dns.

use thiserror::Error;

/// Invalid or contradictory configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load or merge configuration sources.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("{0} and {1} are mutually exclusive")]
    MutuallyExclusive(&'static str, &'static str),

    #[error("conflicting CNAME targets: cname_target {cname_target} vs traefik_cname {traefik_cname}")]
    ConflictingTargets {
        cname_target: String,
        traefik_cname: String,
    },

    #[error("cloudflare: incomplete configuration, missing: {}", .0.join(", "))]
    IncompleteCloudflare(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a container's primary address could not be derived.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unable to find network settings for the network {network_mode}")]
    NoNetwork { network_mode: String },

    #[error("network {0} named by the selector label is not attached")]
    SelectedNetworkMissing(String),

    #[error("network namespace indirection deeper than {0} hops")]
    NamespaceLoop(usize),

    #[error("failed to inspect container {id}: {source}")]
    Inspect {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A single naming policy failed for a container.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("container {0} has no name")]
    MissingName(String),

    #[error("container {0} has no hostname")]
    MissingHostname(String),
}

/// Errors talking to the external DNS/tunnel provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("provider response carried no result")]
    MissingResult,

    #[error("record {0} not found")]
    RecordNotFound(String),
}
