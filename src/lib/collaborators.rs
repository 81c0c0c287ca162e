// SPDX-License-Identifier: Apache-2.0

//! Capability traits for every external dependency (§9, §10.5). Each trait
//! is deliberately narrow and named after the concern it covers rather
//! than bundled into one host-access god object; a `Collaborators` struct
//! threads the concrete (or test-double) implementations through the
//! components that need them.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::error::Result;
use crate::types::{FirewallForward, Lease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDriver {
    Native,
    OpenVSwitch,
}

/// A route snapshot taken before an address flush, to be restored
/// afterwards (§4.3 step 12-13: the kernel drops `protocol=boot` routes
/// when the last address on an interface is removed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
}

/// Interface/address/route/sysctl manipulation, backed by `rtnetlink` +
/// `netlink-packet-route` + `sysctl` in `netbridge-netlink`.
pub trait NetlinkApi: Send + Sync {
    fn link_exists(&self, name: &str) -> Result<bool>;
    fn create_bridge(&self, name: &str, driver: BridgeDriver, mac: [u8; 6], mtu: u32) -> Result<()>;
    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<()>;
    fn set_link_mac(&self, name: &str, mac: [u8; 6]) -> Result<()>;
    fn set_link_up(&self, name: &str) -> Result<()>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn links_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    fn attach_to_bridge(&self, bridge: &str, iface: &str) -> Result<()>;
    /// Removes `iface` from `bridge` without deleting `iface` itself, used
    /// when an `Update` drops a previously-listed external interface
    /// (§4.8 `update`).
    fn detach_from_bridge(&self, iface: &str) -> Result<()>;
    fn enable_vlan_filtering(&self, bridge: &str) -> Result<()>;
    fn has_global_unicast_address(&self, iface: &str) -> Result<bool>;

    fn add_address(&self, iface: &str, addr: IpNetwork) -> Result<()>;
    fn flush_addresses(&self, iface: &str, family: IpFamily) -> Result<()>;
    fn snapshot_boot_routes(&self, iface: &str, family: IpFamily) -> Result<Vec<Route>>;
    fn flush_static_routes(&self, iface: &str, family: IpFamily) -> Result<()>;
    fn add_route(&self, iface: &str, route: &Route) -> Result<()>;

    fn create_ipip_tunnel(&self, name: &str, local_map: &str) -> Result<()>;
    fn create_vxlan_tunnel(&self, name: &str, vni: u32, remote: Option<IpAddr>) -> Result<()>;
    fn create_gre_tunnel(&self, name: &str, local: IpAddr, remote: IpAddr) -> Result<()>;

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()>;
    fn sysctl_get(&self, key: &str) -> Result<String>;

    fn subnet_is_free(&self, candidate: &IpNetwork) -> Result<bool>;
    fn default_ipv4_gateway_subnet(&self) -> Result<Option<IpNetwork>>;
    fn first_host_address_in(&self, underlay: &IpNetwork) -> Result<Option<IpAddr>>;
}

/// OpenVSwitch bridge management, feature-gated onto the netlink backend
/// crate and implemented by shelling out to `ovs-vsctl`.
pub trait OvsApi: Send + Sync {
    fn bridge_exists(&self, name: &str) -> Result<bool>;
    fn create_bridge(&self, name: &str) -> Result<()>;
    fn delete_bridge(&self, name: &str) -> Result<()>;
    fn attach_port(&self, bridge: &str, port: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallFeatures {
    pub icmp_dhcp_dns_access: bool,
    pub forwarding_allow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallSnat {
    pub subnet: IpNetwork,
    pub snat_address: Option<IpAddr>,
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallOpts {
    pub ipv4_features: Option<FirewallFeatures>,
    pub ipv6_features: Option<FirewallFeatures>,
    pub ipv4_snat: Option<FirewallSnat>,
    pub ipv6_snat: Option<FirewallSnat>,
    pub acl: bool,
}

/// NAT/forwarding/ACL/address-forward rule application, backed by
/// `rustables` (nftables) in `netbridge-firewall`.
pub trait FirewallApi: Send + Sync {
    fn network_clear(&self, name: &str, remove_root_chain: bool, families: &[IpFamily]) -> Result<()>;
    fn network_setup(
        &self,
        name: &str,
        listen_v4: Option<IpAddr>,
        listen_v6: Option<IpAddr>,
        opts: &FirewallOpts,
    ) -> Result<()>;
    fn apply_acls(&self, name: &str, acl_names: &[String]) -> Result<()>;
    fn apply_forwards(&self, name: &str, forwards: &[FirewallForward]) -> Result<()>;
    fn enable_hairpin(&self, bridge: &str, port: &str) -> Result<()>;
}

/// A supervised `dnsmasq`/`forkdns` child process.
pub trait ResolverHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn is_alive(&self) -> Result<bool>;
    fn stop(&mut self) -> Result<()>;
    /// Tail of the child's captured stderr, for diagnostics on failure.
    fn stderr_tail(&self) -> String;
}

/// `dnsmasq`/`forkdns` process supervision, backed by `std::process` +
/// `nix` signal handling in `netbridge-resolver`.
pub trait ResolverApi: Send + Sync {
    fn dnsmasq_binary_present(&self) -> bool;
    fn dnsmasq_version(&self) -> Result<(u32, u32)>;
    fn start_dnsmasq(&self, argv: &[String], working_dir: &str) -> Result<Box<dyn ResolverHandle>>;
    fn start_forkdns(&self, argv: &[String], working_dir: &str) -> Result<Box<dyn ResolverHandle>>;
    fn write_leases_file(&self, path: &str, leases: &[Lease]) -> Result<()>;
    fn write_forkdns_servers_file(&self, path: &str, servers: &[IpAddr]) -> Result<()>;
}

/// AppArmor profile load/unload, backed by shelling out to
/// `apparmor_parser` in `netbridge-resolver`.
pub trait AppArmorApi: Send + Sync {
    fn load_profile(&self, network_name: &str, profile_source: &str) -> Result<()>;
    fn unload_profile(&self, network_name: &str) -> Result<()>;
}

/// BGP prefix/forward advertisement. Contract-only per §1: the in-tree
/// implementation is a no-op, real speakers are out of scope.
pub trait BgpSpeakerApi: Send + Sync {
    fn advertise_network(&self, name: &str, prefixes: &[IpNetwork]) -> Result<()>;
    fn withdraw_network(&self, name: &str) -> Result<()>;
    fn advertise_forward(&self, listen_address: IpAddr) -> Result<()>;
    fn withdraw_forward(&self, listen_address: IpAddr) -> Result<()>;
}

/// Network record CRUD against the cluster database. Contract-only: the
/// real cluster DB is out of scope, callers own a concrete or test-double
/// implementation.
pub trait ClusterDb: Send + Sync {
    fn external_subnet_usages(&self) -> Result<Vec<crate::types::ExternalSubnetUsage>>;
    fn acl_exists(&self, project: &str, name: &str) -> Result<bool>;
    fn zone_name_is_unique(&self, project: &str, zone: &str) -> Result<bool>;
}

/// Cluster heartbeat/peer-resolution queries driving `ResolverSupervisor`'s
/// forkdns peer list (§9).
pub trait ClusterNotifier: Send + Sync {
    fn cluster_member_addresses(&self, location_filter: &[String]) -> Result<Vec<IpAddr>>;
    fn node_is_evacuated(&self, node: &str) -> Result<bool>;
}

/// Bundles every collaborator a component needs. Passed explicitly by
/// value/reference at call sites rather than reached for through a
/// singleton, so tests can swap in fakes per-field.
pub struct Collaborators<'a> {
    pub netlink: &'a dyn NetlinkApi,
    pub ovs: &'a dyn OvsApi,
    pub firewall: &'a dyn FirewallApi,
    pub resolver: &'a dyn ResolverApi,
    pub apparmor: &'a dyn AppArmorApi,
    pub bgp: &'a dyn BgpSpeakerApi,
    pub cluster_db: &'a dyn ClusterDb,
    pub cluster_notifier: &'a dyn ClusterNotifier,
    /// When true, `BridgeReconciler::setup`/`stop` record what they would
    /// do without touching the host (§4.3 "mock mode").
    pub mock_mode: bool,
}
