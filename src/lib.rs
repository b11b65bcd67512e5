//! Container-driven DNS.
//!
//! Watches a Docker (or Podman) daemon, derives domain names for running
//! containers through a chain of naming policies, answers A/AAAA/CNAME
//! queries for them and keeps Cloudflare DNS records or tunnel routes in
//! step with what is running.

pub mod cloudflare;
pub mod config;
pub mod discovery;
pub mod dns_server;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod resolvers;
pub mod runtime;
pub mod types;

pub use config::{Config, Setup};
pub use dns_server::{DockerDns, Forwarder, RedirectTarget};
pub use error::{AddressError, ConfigError, ProviderError, ResolveError};
pub use registry::{ContainerRegistry, LookupResult, RegistryEntry};
pub use types::{Container, LifecycleEvent, NetworkAttachment};
