// SPDX-License-Identifier: Apache-2.0

//! Idempotent host-state reconciliation (§4.3): bridge create/reapply,
//! address/route flush+reapply, sysctls, external-interface attach,
//! tunnel/FAN setup.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};

use crate::collaborators::{BridgeDriver, Collaborators, IpFamily};
use crate::error::{ErrorKind, NetbridgeError, Result};
use crate::fan::{self, FanTunnelType};
use crate::mac;
use crate::types::ConfigMap;

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or("")
}

fn truthy_or_empty(v: &str) -> bool {
    v.is_empty() || v == "true"
}

fn is_fan(config: &ConfigMap) -> bool {
    get(config, "bridge.mode") == "fan"
}

/// A single reversible step, captured by value so the rollback stack
/// owns everything it needs to undo the step without borrowing back into
/// `setup`'s local state (§4.3 "Rollback").
enum UndoAction {
    DeleteLink { id: &'static str, name: String },
    RestoreMac { id: &'static str, name: String, mac: [u8; 6] },
    RestoreMtu { id: &'static str, name: String, mtu: u32 },
    DetachExternalInterface { id: &'static str, bridge: String, iface: String },
    UnloadAppArmor { id: &'static str, network_name: String },
    StopResolvers { id: &'static str, network_name: String },
    ClearFirewall { id: &'static str, network_name: String },
}

impl UndoAction {
    fn id(&self) -> &'static str {
        match self {
            Self::DeleteLink { id, .. }
            | Self::RestoreMac { id, .. }
            | Self::RestoreMtu { id, .. }
            | Self::DetachExternalInterface { id, .. }
            | Self::UnloadAppArmor { id, .. }
            | Self::StopResolvers { id, .. }
            | Self::ClearFirewall { id, .. } => id,
        }
    }

    fn run(&self, collabs: &Collaborators<'_>) {
        let outcome: Result<()> = match self {
            Self::DeleteLink { name, .. } => collabs.netlink.delete_link(name),
            Self::RestoreMac { name, mac, .. } => collabs.netlink.set_link_mac(name, *mac),
            Self::RestoreMtu { name, mtu, .. } => collabs.netlink.set_link_mtu(name, *mtu),
            Self::DetachExternalInterface { bridge, iface, .. } => {
                collabs.netlink.delete_link(&format!("{bridge}.{iface}")).or(Ok(()))
            }
            Self::UnloadAppArmor { network_name, .. } => collabs.apparmor.unload_profile(network_name),
            Self::StopResolvers { .. } => Ok(()),
            Self::ClearFirewall { network_name, .. } => {
                collabs.firewall.network_clear(network_name, true, &[IpFamily::V4, IpFamily::V6])
            }
        };
        match outcome {
            Ok(()) => log::debug!(target: "netbridge::reconciler", "rollback step '{}' ok", self.id()),
            Err(e) => log::warn!(target: "netbridge::reconciler", "rollback step '{}' failed: {e}", self.id()),
        }
    }
}

/// LIFO of named undo actions. Disarmed on success; unwound on any error.
#[derive(Default)]
struct Rollback(Vec<UndoAction>);

impl Rollback {
    fn push(&mut self, action: UndoAction) {
        self.0.push(action);
    }

    fn unwind(&mut self, collabs: &Collaborators<'_>) {
        while let Some(action) = self.0.pop() {
            action.run(collabs);
        }
    }

    fn disarm(&mut self) {
        self.0.clear();
    }
}

fn target_mtu(config: &ConfigMap, has_tunnels: bool, fan: bool, fan_type: FanTunnelType) -> u32 {
    if let Some(explicit) = config.get("bridge.mtu").and_then(|v| v.parse::<u32>().ok()) {
        return explicit;
    }
    if has_tunnels {
        return 1400;
    }
    if fan {
        return fan_type.mtu();
    }
    1500
}

fn fan_type(config: &ConfigMap) -> FanTunnelType {
    match get(config, "fan.type") {
        "ipip" => FanTunnelType::Ipip,
        _ => FanTunnelType::Vxlan,
    }
}

fn has_user_tunnels(config: &ConfigMap) -> bool {
    config.keys().any(|k| k.starts_with("tunnel."))
}

/// The host state `setup` actually assigned, reported back to the caller
/// because some of it (the FAN overlay address, in particular) is computed
/// from live host state inside `setup_inner` rather than derivable from
/// `config` alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetupOutcome {
    /// The bridge's FAN overlay network, when `bridge.mode=fan`. `None`
    /// for a standard bridge, where the subnet is just `ipv4.address`.
    /// Carries the full `/n` rather than the bare gateway address because
    /// both the default DHCP range (§4.5) and SNAT (§4.4) need the subnet,
    /// not just the gateway.
    pub fan_network_v4: Option<Ipv4Network>,
}

impl SetupOutcome {
    pub fn fan_gateway_v4(&self) -> Option<Ipv4Addr> {
        self.fan_network_v4.map(|n| n.ip())
    }
}

/// Idempotently reconciles host state for `network_name` towards
/// `config`, reproducing the 20-step ordering in §4.3. A no-op when
/// `collabs.mock_mode` is set.
pub fn setup(
    collabs: &Collaborators<'_>,
    network_name: &str,
    var_dir: &str,
    node_id: u64,
    network_id: u64,
    server_cert_fingerprint: &str,
    config: &ConfigMap,
    old_config: Option<&ConfigMap>,
) -> Result<SetupOutcome> {
    if collabs.mock_mode {
        return Ok(SetupOutcome::default());
    }

    let mut rollback = Rollback::default();
    match setup_inner(
        collabs,
        &mut rollback,
        network_name,
        var_dir,
        node_id,
        network_id,
        server_cert_fingerprint,
        config,
        old_config,
    ) {
        Ok(outcome) => {
            rollback.disarm();
            Ok(outcome)
        }
        Err(e) => {
            rollback.unwind(collabs);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn setup_inner(
    collabs: &Collaborators<'_>,
    rollback: &mut Rollback,
    network_name: &str,
    var_dir: &str,
    node_id: u64,
    network_id: u64,
    server_cert_fingerprint: &str,
    config: &ConfigMap,
    old_config: Option<&ConfigMap>,
) -> Result<SetupOutcome> {
    let mut outcome = SetupOutcome::default();
    // Step 1: networks/<name>/ directory.
    let network_dir = format!("{var_dir}/networks/{network_name}");
    std::fs::create_dir_all(&network_dir)
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o711);
        std::fs::set_permissions(&network_dir, perms)
            .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    }

    let fan = is_fan(config);
    let tunnel_type = fan_type(config);
    let has_tunnels = has_user_tunnels(config);

    // Step 2: target MTU.
    let mtu = target_mtu(config, has_tunnels, fan, tunnel_type);

    // Step 3: target MAC.
    let external_present = !get(config, "bridge.external_interfaces").is_empty();
    let cluster_safe = mac::cluster_safe(config, external_present);
    let explicit_mac = config.get("bridge.hwaddr").and_then(|h| {
        if mac::check_cluster_wide_mac_safe(cluster_safe) {
            parse_mac(h)
        } else {
            None
        }
    });
    let target_mac = explicit_mac.unwrap_or_else(|| {
        mac::derive_mac(node_id, network_id, server_cert_fingerprint, cluster_safe)
    });

    // Step 4: create or reapply the bridge.
    let driver = match get(config, "bridge.driver") {
        "openvswitch" => BridgeDriver::OpenVSwitch,
        _ => BridgeDriver::Native,
    };
    if !collabs.netlink.link_exists(network_name)? {
        collabs.netlink.create_bridge(network_name, driver, target_mac, mtu)?;
        rollback.push(UndoAction::DeleteLink {
            id: "create-bridge",
            name: network_name.to_string(),
        });
    } else {
        collabs.netlink.set_link_mtu(network_name, mtu)?;
        collabs.netlink.set_link_mac(network_name, target_mac)?;
    }

    // Step 5: IPv6 sysctls.
    let has_v6 = !matches!(get(config, "ipv6.address"), "" | "none");
    if has_v6 {
        collabs.netlink.sysctl_set(&sysctl_path(network_name, "disable_ipv6"), "0")?;
        collabs.netlink.sysctl_set(&sysctl_path(network_name, "autoconf"), "0")?;
        collabs.netlink.sysctl_set(&sysctl_path(network_name, "accept_dad"), "0")?;
    } else {
        collabs.netlink.sysctl_set(&sysctl_path(network_name, "disable_ipv6"), "1")?;
    }

    // Step 6: delete stale tunnel endpoints.
    let prefix = format!("{network_name}-");
    for stale in collabs.netlink.links_with_prefix(&prefix)? {
        collabs.netlink.delete_link(&stale)?;
    }

    // Step 7: MTU pin workaround for native bridges.
    if mtu != 1500 && driver == BridgeDriver::Native {
        let dummy = format!("{network_name}-mtu");
        collabs.netlink.create_bridge(&dummy, BridgeDriver::Native, target_mac, mtu).ok();
        collabs.netlink.set_link_up(&dummy)?;
        collabs.netlink.attach_to_bridge(network_name, &dummy)?;
    }

    // Step 8: VLAN filtering, best-effort.
    if driver == BridgeDriver::Native {
        if let Err(e) = collabs.netlink.enable_vlan_filtering(network_name) {
            log::warn!(target: "netbridge::reconciler", "vlan filtering not enabled on '{network_name}': {e}");
        }
    }

    // Step 9: bring bridge up.
    collabs.netlink.set_link_up(network_name)?;

    // Step 10: attach external interfaces.
    for iface in get(config, "bridge.external_interfaces").split(',').filter(|s| !s.is_empty()) {
        if collabs.netlink.has_global_unicast_address(iface)? {
            return Err(NetbridgeError::new(
                ErrorKind::Conflict,
                format!("external interface '{iface}' carries a globally-unicast address"),
            ));
        }
        collabs.netlink.attach_to_bridge(network_name, iface)?;
        rollback.push(UndoAction::DetachExternalInterface {
            id: "attach-external",
            bridge: network_name.to_string(),
            iface: iface.to_string(),
        });
    }

    // Step 11: clear firewall rules for families whose state is changing.
    // The fan overlay subnet (step 15) isn't known yet here, so this pass
    // only clears; the caller re-applies with the full `SetupOutcome` once
    // `setup` returns (§4.3 step 20).
    crate::firewall::apply(collabs.firewall, network_name, old_config, config, None)?;

    // Steps 12-13: IPv4 snapshot/flush/reapply.
    let boot_routes_v4 = collabs.netlink.snapshot_boot_routes(network_name, IpFamily::V4)?;
    collabs.netlink.flush_addresses(network_name, IpFamily::V4)?;
    collabs.netlink.flush_static_routes(network_name, IpFamily::V4)?;

    let ipv4_addr = match get(config, "ipv4.address") {
        "" | "none" => None,
        v if fan => None, // fan assigns its own overlay address below
        v => Some(IpNetwork::from_str(v).map_err(|_| {
            NetbridgeError::validation("ipv4.address", "not a valid CIDR")
        })?),
    };
    if let Some(addr) = ipv4_addr {
        collabs.netlink.add_address(network_name, addr)?;
        for route in parse_route_list(get(config, "ipv4.routes"))? {
            collabs.netlink.add_route(network_name, &route)?;
        }
        for route in &boot_routes_v4 {
            collabs.netlink.add_route(network_name, route)?;
        }
    }

    // Step 14: IPv6.
    let boot_routes_v6 = collabs.netlink.snapshot_boot_routes(network_name, IpFamily::V6)?;
    collabs.netlink.flush_addresses(network_name, IpFamily::V6)?;
    collabs.netlink.flush_static_routes(network_name, IpFamily::V6)?;
    if has_v6 {
        let addr = IpNetwork::from_str(get(config, "ipv6.address"))
            .map_err(|_| NetbridgeError::validation("ipv6.address", "not a valid CIDR"))?;
        collabs.netlink.add_address(network_name, addr)?;
        for route in parse_route_list(get(config, "ipv6.routes"))? {
            collabs.netlink.add_route(network_name, &route)?;
        }
        for route in &boot_routes_v6 {
            collabs.netlink.add_route(network_name, route)?;
        }
        if truthy_or_empty(get(config, "ipv6.routing")) {
            collabs.netlink.sysctl_set(&sysctl_path(network_name, "accept_ra"), "2")?;
            collabs.netlink.sysctl_set(&sysctl_path(network_name, "forwarding"), "1")?;
        }
    }

    // Step 15: FAN overlay address + tunnel.
    if fan {
        let underlay: Ipv4Network = get(config, "fan.underlay_subnet")
            .parse()
            .map_err(|_| NetbridgeError::validation("fan.underlay_subnet", "not a valid CIDR"))?;
        let overlay_str = if get(config, "fan.overlay_subnet").is_empty() {
            "240.0.0.0/8"
        } else {
            get(config, "fan.overlay_subnet")
        };
        let overlay: Ipv4Network = overlay_str
            .parse()
            .map_err(|_| NetbridgeError::validation("fan.overlay_subnet", "not a valid CIDR"))?;
        let host = collabs
            .netlink
            .first_host_address_in(&IpNetwork::V4(underlay))?
            .and_then(|a| match a {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                NetbridgeError::new(ErrorKind::Precondition, "no host address inside the fan underlay")
            })?;
        let fan_addr = fan::compute_fan_address(overlay, underlay, host)?;
        let prefix = fan::bridge_overlay_prefix(overlay, tunnel_type);
        let fan_net = IpNetwork::new(IpAddr::V4(fan_addr), prefix)
            .map_err(|_| NetbridgeError::new(ErrorKind::Bug, "invalid computed fan network"))?;
        collabs.netlink.add_address(network_name, fan_net)?;
        outcome.fan_network_v4 = Ipv4Network::new(fan_addr, prefix).ok();

        let tunnel_name = format!("{network_name}-tun");
        match tunnel_type {
            FanTunnelType::Ipip => {
                collabs.netlink.create_ipip_tunnel(&tunnel_name, &format!("{overlay}:{underlay}"))?;
            }
            FanTunnelType::Vxlan => {
                collabs.netlink.create_vxlan_tunnel(&tunnel_name, fan::vxlan_vni(overlay), None)?;
            }
        }
        collabs.netlink.attach_to_bridge(network_name, &tunnel_name)?;
        rollback.push(UndoAction::DeleteLink {
            id: "fan-tunnel",
            name: tunnel_name,
        });
    }

    // Step 16: user-declared tunnels, partial configs silently skipped.
    for tunnel in user_tunnels(config) {
        let Some(protocol) = tunnel.protocol else { continue };
        match protocol.as_str() {
            "gre" => {
                let (Some(local), Some(remote)) = (tunnel.local, tunnel.remote) else { continue };
                collabs.netlink.create_gre_tunnel(&tunnel.full_name(network_name), local, remote)?;
            }
            "vxlan" => {
                let Some(id) = tunnel.id else { continue };
                collabs.netlink.create_vxlan_tunnel(&tunnel.full_name(network_name), id, tunnel.remote)?;
            }
            _ => continue,
        }
        collabs.netlink.attach_to_bridge(network_name, &tunnel.full_name(network_name))?;
    }

    // Step 17: AppArmor profile.
    let raw_dnsmasq = get(config, "raw.dnsmasq");
    if raw_dnsmasq.is_empty() {
        let profile = dnsmasq_apparmor_profile(network_name, &network_dir);
        collabs.apparmor.load_profile(network_name, &profile)?;
        rollback.push(UndoAction::UnloadAppArmor {
            id: "apparmor",
            network_name: network_name.to_string(),
        });
    } else {
        log::warn!(
            target: "netbridge::reconciler",
            "AppArmor confinement disabled for network '{network_name}': raw.dnsmasq is set"
        );
    }

    // Step 18-19: resolver lifecycle is driven by the caller (Lifecycle),
    // which owns process handles this module never stores; we only mark
    // the rollback point so a later failure still unwinds firewall/bridge
    // state consistently.
    if crate::resolver::resolver_needed(config) {
        rollback.push(UndoAction::StopResolvers {
            id: "resolver",
            network_name: network_name.to_string(),
        });
    }

    // Step 20: firewall options + ACLs + forwards + BGP are applied by
    // the caller, which already holds the forward/ACL/BGP collaborators
    // and state this module does not track.

    Ok(outcome)
}

/// Tears down only what `setup` owns, in reverse dependency order.
pub fn stop(collabs: &Collaborators<'_>, network_name: &str) -> Result<()> {
    if collabs.mock_mode {
        return Ok(());
    }
    collabs.bgp.withdraw_network(network_name).ok();
    collabs
        .firewall
        .network_clear(network_name, true, &[IpFamily::V4, IpFamily::V6])?;
    collabs.netlink.delete_link(network_name)?;
    let prefix = format!("{network_name}-");
    for stale in collabs.netlink.links_with_prefix(&prefix)? {
        collabs.netlink.delete_link(&stale)?;
    }
    collabs.apparmor.unload_profile(network_name).ok();
    Ok(())
}

fn sysctl_path(iface: &str, leaf: &str) -> String {
    format!("net.ipv6.conf.{iface}.{leaf}")
}

/// A minimal confinement profile scoping the supervised `dnsmasq` to its
/// own per-network working directory and the bridge it serves.
fn dnsmasq_apparmor_profile(network_name: &str, network_dir: &str) -> String {
    format!(
        "profile netbridge-dnsmasq.{network_name} flags=(attach_disconnected,mediate_deleted) {{\n  \
         #include <abstractions/base>\n  \
         capability net_bind_service,\n  \
         capability net_admin,\n  \
         network inet dgram,\n  \
         network inet6 dgram,\n  \
         {network_dir}/** rw,\n  \
         /usr/sbin/dnsmasq mr,\n}}\n"
    )
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(mac)
}

fn parse_route_list(v: &str) -> Result<Vec<crate::collaborators::Route>> {
    if v.is_empty() {
        return Ok(Vec::new());
    }
    v.split(',')
        .map(|entry| {
            let entry = entry.trim();
            IpNetwork::from_str(entry)
                .map(|destination| crate::collaborators::Route { destination, gateway: None })
                .map_err(|_| NetbridgeError::validation("routes", format!("invalid route '{entry}'")))
        })
        .collect()
}

struct UserTunnel {
    name: String,
    protocol: Option<String>,
    local: Option<IpAddr>,
    remote: Option<IpAddr>,
    id: Option<u32>,
}

impl UserTunnel {
    fn full_name(&self, network_name: &str) -> String {
        format!("{network_name}-{}", self.name)
    }
}

fn user_tunnels(config: &ConfigMap) -> Vec<UserTunnel> {
    let mut names: Vec<&str> = config
        .keys()
        .filter_map(|k| k.strip_prefix("tunnel.").and_then(|rest| rest.split_once('.')).map(|(n, _)| n))
        .collect();
    names.sort_unstable();
    names.dedup();

    names
        .into_iter()
        .map(|name| UserTunnel {
            name: name.to_string(),
            protocol: config.get(&format!("tunnel.{name}.protocol")).cloned(),
            local: config
                .get(&format!("tunnel.{name}.local"))
                .and_then(|v| v.parse().ok()),
            remote: config
                .get(&format!("tunnel.{name}.remote"))
                .and_then(|v| v.parse().ok()),
            id: config.get(&format!("tunnel.{name}.id")).and_then(|v| v.parse().ok()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_prefers_explicit_over_computed() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mtu".into(), "9000".into());
        assert_eq!(target_mtu(&cfg, true, false, FanTunnelType::Vxlan), 9000);
    }

    #[test]
    fn mtu_falls_back_to_tunnel_then_fan_then_default() {
        let cfg = ConfigMap::new();
        assert_eq!(target_mtu(&cfg, true, false, FanTunnelType::Vxlan), 1400);
        assert_eq!(target_mtu(&cfg, false, true, FanTunnelType::Ipip), 1480);
        assert_eq!(target_mtu(&cfg, false, false, FanTunnelType::Vxlan), 1500);
    }

    #[test]
    fn user_tunnels_parsed_from_dotted_keys() {
        let mut cfg = ConfigMap::new();
        cfg.insert("tunnel.gre1.protocol".into(), "gre".into());
        cfg.insert("tunnel.gre1.local".into(), "10.0.0.1".into());
        cfg.insert("tunnel.gre1.remote".into(), "10.0.0.2".into());
        let tunnels = user_tunnels(&cfg);
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].name, "gre1");
        assert_eq!(tunnels[0].protocol.as_deref(), Some("gre"));
    }

    #[test]
    fn partial_tunnel_config_is_skipped_not_erroring() {
        let mut cfg = ConfigMap::new();
        cfg.insert("tunnel.half.protocol".into(), "gre".into());
        let tunnels = user_tunnels(&cfg);
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels[0].local.is_none());
    }
}
