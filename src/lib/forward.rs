// SPDX-License-Identifier: Apache-2.0

//! Per-member address-forward CRUD, conflict detection and firewall
//! projection (§4.6).

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::collaborators::FirewallApi;
use crate::error::{ErrorKind, NetbridgeError, Result};
use crate::types::{AddressForward, ConfigMap, ExternalSubnetUsage, FirewallForward, PortMap};

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or("")
}

fn in_ovn_ranges(addr: IpAddr, ranges_csv: &str) -> bool {
    ranges_csv
        .split(',')
        .filter(|r| !r.trim().is_empty())
        .filter_map(|r| {
            let (lo, hi) = r.trim().split_once('-')?;
            Some((lo.parse::<IpAddr>().ok()?, hi.parse::<IpAddr>().ok()?))
        })
        .any(|(lo, hi)| lo <= addr && addr <= hi)
}

fn contains_or_is_contained(addr: IpAddr, subnet: &IpNetwork) -> bool {
    subnet.contains(addr)
}

/// Checks `listen_address` against every recorded external-subnet usage,
/// per the rule in §4.6: a forward's listen address is allowed to sit
/// inside its *own* network's subnet or SNAT address (identified by
/// `own_network_name`), but not inside any other usage type of the same
/// network, nor inside any other network's usages at all.
pub fn check_conflict(
    listen_address: IpAddr,
    own_network_name: &str,
    usages: &[ExternalSubnetUsage],
    existing_forwards: &[AddressForward],
) -> Result<()> {
    for usage in usages {
        let is_own_network_subnet_or_snat = matches!(
            usage.usage_type,
            crate::types::ExternalSubnetUsageType::Network
                | crate::types::ExternalSubnetUsageType::NetworkSnat
        ) && usage.network_name.as_deref() == Some(own_network_name);

        if is_own_network_subnet_or_snat {
            continue;
        }
        if contains_or_is_contained(listen_address, &usage.subnet) {
            return Err(NetbridgeError::conflict(format!(
                "address {listen_address} overlaps an existing {:?}",
                usage.usage_type
            )));
        }
    }

    for forward in existing_forwards {
        if forward.listen_address == listen_address {
            return Err(NetbridgeError::conflict(format!(
                "forward already exists for {listen_address}"
            )));
        }
    }

    Ok(())
}

/// Rejects a listen address that is unspecified or inside any
/// `*.ovn.ranges` range (§4.6 create rule: "reject unspecified... no
/// auto-allocation on bridge").
pub fn validate_listen_address(listen_address: Option<IpAddr>, network_config: &ConfigMap) -> Result<IpAddr> {
    let addr = listen_address.ok_or_else(|| {
        NetbridgeError::new(
            ErrorKind::Validation,
            "forward listen address must be specified explicitly",
        )
    })?;
    let ranges_key = match addr {
        IpAddr::V4(_) => "ipv4.ovn.ranges",
        IpAddr::V6(_) => "ipv6.ovn.ranges",
    };
    if in_ovn_ranges(addr, get(network_config, ranges_key)) {
        return Err(NetbridgeError::conflict(format!(
            "{addr} falls inside a '{ranges_key}' range reserved for child OVN"
        )));
    }
    Ok(addr)
}

/// Projects an `AddressForward` to zero or more firewall records (§4.6
/// "Firewall projection"): one catch-all record when a default target is
/// present, then one record per port map.
pub fn project_to_firewall(forward: &AddressForward) -> Vec<FirewallForward> {
    let mut records = Vec::new();

    if let Some(target) = forward.target_address {
        records.push(FirewallForward {
            listen: forward.listen_address,
            protocol: None,
            target,
            listen_ports: None,
            target_ports: None,
        });
    }

    for pm in &forward.port_maps {
        records.push(project_port_map(forward.listen_address, pm));
    }

    records
}

fn project_port_map(listen: IpAddr, pm: &PortMap) -> FirewallForward {
    FirewallForward {
        listen,
        protocol: Some(pm.protocol),
        target: pm.target_address,
        listen_ports: Some(pm.listen_ports.clone()),
        target_ports: Some(pm.target_ports.clone()),
    }
}

/// Re-derives the full firewall-forward set for a network and hands it to
/// the firewall backend, as every CRUD path does after mutating the DB
/// record (§4.6).
pub fn apply_forwards(
    firewall: &dyn FirewallApi,
    network_name: &str,
    forwards: &[AddressForward],
) -> Result<()> {
    let projected: Vec<FirewallForward> = forwards.iter().flat_map(project_to_firewall).collect();
    firewall.apply_forwards(network_name, &projected)
}

/// Enables hairpin mode on every NIC port of `network_name`, gated on
/// `br_netfilter` being loaded for at least one IP family and only meant
/// to be invoked once, on the first forward created for a network.
pub fn enable_hairpin_if_first_forward(
    firewall: &dyn FirewallApi,
    bridge: &str,
    ports: &[String],
    is_first_forward: bool,
    br_netfilter_loaded: bool,
) -> Result<()> {
    if !is_first_forward || !br_netfilter_loaded {
        return Ok(());
    }
    for port in ports {
        firewall.enable_hairpin(bridge, port)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExternalSubnetUsageType, Protocol};

    fn usage(subnet: &str, usage_type: ExternalSubnetUsageType) -> ExternalSubnetUsage {
        ExternalSubnetUsage {
            subnet: subnet.parse().unwrap(),
            usage_type,
            network_project: Some("default".into()),
            network_name: Some("br1".into()),
            instance_project: None,
            instance_name: None,
            instance_device: None,
        }
    }

    #[test]
    fn conflict_when_inside_other_networks_subnet() {
        let usages = vec![usage("10.10.0.0/24", ExternalSubnetUsageType::Network)];
        let addr: IpAddr = "10.10.0.5".parse().unwrap();
        assert!(check_conflict(addr, "br2", &usages, &[]).is_err());
    }

    #[test]
    fn no_conflict_inside_own_networks_subnet() {
        let usages = vec![usage("10.10.0.0/24", ExternalSubnetUsageType::Network)];
        let addr: IpAddr = "10.10.0.5".parse().unwrap();
        assert!(check_conflict(addr, "br1", &usages, &[]).is_ok());
    }

    #[test]
    fn no_conflict_outside_any_usage() {
        let usages = vec![usage("10.10.0.0/24", ExternalSubnetUsageType::Network)];
        let addr: IpAddr = "10.20.0.5".parse().unwrap();
        assert!(check_conflict(addr, "br2", &usages, &[]).is_ok());
    }

    #[test]
    fn duplicate_forward_listen_address_conflicts() {
        let existing = AddressForward {
            network_id: 1,
            member_id: "m1".into(),
            listen_address: "203.0.113.5".parse().unwrap(),
            description: "".into(),
            target_address: None,
            port_maps: vec![],
        };
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(check_conflict(addr, "br1", &[], &[existing]).is_err());
    }

    #[test]
    fn unspecified_listen_address_rejected() {
        assert!(validate_listen_address(None, &ConfigMap::new()).is_err());
    }

    #[test]
    fn listen_address_inside_ovn_range_rejected() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.ovn.ranges".into(), "10.0.0.100-10.0.0.150".into());
        let addr: IpAddr = "10.0.0.120".parse().unwrap();
        assert!(validate_listen_address(Some(addr), &cfg).is_err());
    }

    #[test]
    fn listen_address_outside_ovn_range_accepted() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.ovn.ranges".into(), "10.0.0.100-10.0.0.150".into());
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(validate_listen_address(Some(addr), &cfg).unwrap(), addr);
    }

    #[test]
    fn projection_emits_catchall_then_port_maps() {
        let forward = AddressForward {
            network_id: 1,
            member_id: "m1".into(),
            listen_address: "203.0.113.5".parse().unwrap(),
            description: "".into(),
            target_address: Some("10.0.0.2".parse().unwrap()),
            port_maps: vec![PortMap {
                protocol: Protocol::Tcp,
                listen_ports: vec![80],
                target_address: "10.0.0.3".parse().unwrap(),
                target_ports: vec![8080],
            }],
        };
        let records = project_to_firewall(&forward);
        assert_eq!(records.len(), 2);
        assert!(records[0].protocol.is_none());
        assert_eq!(records[1].protocol, Some(Protocol::Tcp));
    }
}
