//! Data structures shared between the container runtime, the registry and
//! the DNS server.
//!
//! [`Container`] is the crate's own view of a running container.  It is
//! smaller than the Docker inspect payload: only the fields
//! that take part in naming and address resolution are kept, already
//! parsed into addresses.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Number of characters of a container id shown in log lines.
const SHORT_ID_LEN: usize = 12;

/// A container as seen by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    /// Opaque runtime identifier.
    pub id: String,
    /// Container name without the leading `/`.
    pub name: String,
    /// Hostname configured inside the container.
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    /// Raw network mode, e.g. `bridge`, `host` or `container:<id>`.
    pub network_mode: String,
    /// Top-level (default bridge) IPv4 address.
    pub ip_address: Option<Ipv4Addr>,
    /// Top-level (default bridge) global IPv6 address.
    pub global_ipv6_address: Option<Ipv6Addr>,
    /// Network attachments keyed by network name.
    pub networks: BTreeMap<String, NetworkAttachment>,
}

/// One network a container is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub ip_address: Option<Ipv4Addr>,
    pub global_ipv6_address: Option<Ipv6Addr>,
    pub aliases: Vec<String>,
}

impl Container {
    /// The first twelve characters of the id, as Docker prints them.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The id of the container whose network namespace this one joins,
    /// if the network mode is `container:<id>`.
    pub fn namespace_owner(&self) -> Option<&str> {
        self.network_mode.strip_prefix("container:")
    }

    pub fn uses_host_network(&self) -> bool {
        self.network_mode == "host"
    }
}

/// Shortens a container id for logging without panicking on short ids.
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// A lifecycle change reported by a container runtime.
///
/// `Started` carries the freshly inspected container and is also used for
/// network connect/disconnect, which only require a recompute.
/// `Synced` closes every full scan with the ids that were running at the
/// time; anything else the registry still holds stopped unobserved.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Started(Container),
    Stopped { id: String },
    Synced { running: Vec<String> },
}
