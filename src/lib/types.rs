// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// String-keyed config map, as stored by the cluster DB (§3 Config map).
pub type ConfigMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Pending,
    Created,
    Errored,
    Unknown,
}

/// Network identity and attributes (§3 Network entity). `id` is immutable
/// once a `Network` leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Network {
    pub project_name: String,
    pub id: u64,
    pub name: String,
    pub description: String,
    pub status: NetworkStatus,
    /// Per-member local status; the global `status` is `Created` iff every
    /// entry here is `Created`.
    pub local_status: BTreeMap<String, NetworkStatus>,
    pub config: ConfigMap,
    pub locations: Vec<String>,
}

impl Network {
    pub fn is_globally_created(&self) -> bool {
        !self.local_status.is_empty()
            && self
                .local_status
                .values()
                .all(|s| matches!(s, NetworkStatus::Created))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// One `protocol`/port-range pair of an address forward (§3 AddressForward).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortMap {
    pub protocol: Protocol,
    pub listen_ports: Vec<u16>,
    pub target_address: IpAddr,
    pub target_ports: Vec<u16>,
}

/// Identity: `(network_id, member_id, listen_address)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressForward {
    pub network_id: u64,
    pub member_id: String,
    pub listen_address: IpAddr,
    pub description: String,
    pub target_address: Option<IpAddr>,
    pub port_maps: Vec<PortMap>,
}

impl AddressForward {
    /// Hash of the fields `Update` treats as significant, used for the
    /// e-tag idempotence check in §4.6.
    pub fn content_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.description.hash(&mut hasher);
        self.target_address.hash(&mut hasher);
        for pm in &self.port_maps {
            pm.protocol.hash(&mut hasher);
            pm.listen_ports.hash(&mut hasher);
            pm.target_address.hash(&mut hasher);
            pm.target_ports.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl std::hash::Hash for Protocol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (*self as u8).hash(state)
    }
}

/// A single record projected from an `AddressForward` to the firewall
/// backend (§4.6 Firewall projection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallForward {
    pub listen: IpAddr,
    pub protocol: Option<Protocol>,
    pub target: IpAddr,
    pub listen_ports: Option<Vec<u16>>,
    pub target_ports: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseType {
    Gateway,
    Uplink,
    Static,
    Dynamic,
}

/// §3 Lease.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lease {
    pub hostname: String,
    pub address: IpAddr,
    pub hwaddr: Option<[u8; 6]>,
    pub lease_type: LeaseType,
    pub location: String,
    pub project: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ExternalSubnetUsageType {
    Network,
    NetworkSnat,
    NetworkForward,
    Instance,
    Proxy,
}

/// Derived, transient: rebuilt on each conflict check (§3
/// ExternalSubnetUsage), never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubnetUsage {
    pub subnet: ipnetwork::IpNetwork,
    pub usage_type: ExternalSubnetUsageType,
    pub network_project: Option<String>,
    pub network_name: Option<String>,
    pub instance_project: Option<String>,
    pub instance_name: Option<String>,
    pub instance_device: Option<String>,
}

impl ExternalSubnetUsage {
    pub fn for_network(
        subnet: ipnetwork::IpNetwork,
        usage_type: ExternalSubnetUsageType,
        project: &str,
        name: &str,
    ) -> Self {
        Self {
            subnet,
            usage_type,
            network_project: Some(project.to_string()),
            network_name: Some(name.to_string()),
            instance_project: None,
            instance_name: None,
            instance_device: None,
        }
    }
}
