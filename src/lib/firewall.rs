// SPDX-License-Identifier: Apache-2.0

//! Desired firewall state computation and application (§4.4).

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};

use crate::collaborators::{FirewallApi, FirewallFeatures, FirewallOpts, FirewallSnat, IpFamily};
use crate::error::Result;
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

fn has_firewall(config: &ConfigMap, family: IpFamily) -> bool {
    let (addr_key, firewall_key) = match family {
        IpFamily::V4 => ("ipv4.address", "ipv4.firewall"),
        IpFamily::V6 => ("ipv6.address", "ipv6.firewall"),
    };
    let has_address = is_fan(config) || !matches!(get(config, addr_key), "" | "none");
    has_address && get(config, firewall_key) != "false"
}

fn has_dhcp(config: &ConfigMap, family: IpFamily) -> bool {
    let key = match family {
        IpFamily::V4 => "ipv4.dhcp",
        IpFamily::V6 => "ipv6.dhcp",
    };
    get(config, key) != "false"
}

fn features_for(config: &ConfigMap, family: IpFamily) -> Option<FirewallFeatures> {
    if !has_firewall(config, family) {
        return None;
    }
    let routing_key = match family {
        IpFamily::V4 => "ipv4.routing",
        IpFamily::V6 => "ipv6.routing",
    };
    let routing = is_fan(config) || truthy_or_empty(get(config, routing_key));
    Some(FirewallFeatures {
        icmp_dhcp_dns_access: has_dhcp(config, family),
        forwarding_allow: routing,
    })
}

/// Computes the SNAT subnet/target for `family`. In FAN mode `ipv4.address`
/// is never set (§4.1 composite rules) and the overlay subnet is instead
/// computed at reconcile time, so the v4 case falls back to `fan_subnet`
/// when it's set.
fn snat_for(config: &ConfigMap, family: IpFamily, fan_subnet: Option<Ipv4Network>) -> Option<FirewallSnat> {
    let (addr_key, nat_key, nat_addr_key, nat_order_key) = match family {
        IpFamily::V4 => ("ipv4.address", "ipv4.nat", "ipv4.nat.address", "ipv4.nat.order"),
        IpFamily::V6 => ("ipv6.address", "ipv6.nat", "ipv6.nat.address", "ipv6.nat.order"),
    };
    if get(config, nat_key) != "true" {
        return None;
    }
    let subnet = if family == IpFamily::V4 && is_fan(config) {
        IpNetwork::V4(fan_subnet?)
    } else {
        IpNetwork::from_str(get(config, addr_key)).ok()?
    };
    Some(FirewallSnat {
        subnet,
        snat_address: get(config, nat_addr_key)
            .parse::<IpAddr>()
            .ok()
            .filter(|_| !get(config, nat_addr_key).is_empty()),
        append: get(config, nat_order_key) == "after",
    })
}

/// Computes the desired firewall state from an effective config map.
/// `fan_subnet` is the bridge's computed FAN overlay network (`None`
/// outside fan mode), needed because fan networks carry no `ipv4.address`.
pub fn compute_opts(config: &ConfigMap, fan_subnet: Option<Ipv4Network>) -> FirewallOpts {
    FirewallOpts {
        ipv4_features: features_for(config, IpFamily::V4),
        ipv6_features: features_for(config, IpFamily::V6),
        ipv4_snat: snat_for(config, IpFamily::V4, fan_subnet),
        ipv6_snat: snat_for(config, IpFamily::V6, None),
        acl: !get(config, "security.acls").is_empty(),
    }
}

fn changing_families(old: Option<&ConfigMap>, new: &ConfigMap) -> Vec<IpFamily> {
    match old {
        None => vec![IpFamily::V4, IpFamily::V6],
        Some(old) => {
            let mut families = Vec::new();
            if get(old, "ipv4.address") != get(new, "ipv4.address")
                || get(old, "ipv4.firewall") != get(new, "ipv4.firewall")
                || get(old, "ipv4.nat") != get(new, "ipv4.nat")
            {
                families.push(IpFamily::V4);
            }
            if get(old, "ipv6.address") != get(new, "ipv6.address")
                || get(old, "ipv6.firewall") != get(new, "ipv6.firewall")
                || get(old, "ipv6.nat") != get(new, "ipv6.nat")
            {
                families.push(IpFamily::V6);
            }
            families
        }
    }
}

fn listen_addresses(config: &ConfigMap, fan_subnet: Option<Ipv4Network>) -> (Option<IpAddr>, Option<IpAddr>) {
    let v4 = if is_fan(config) {
        fan_subnet.map(|n| IpAddr::V4(n.ip()))
    } else {
        IpNetwork::from_str(get(config, "ipv4.address")).ok().map(|n| n.ip())
    };
    let v6 = IpNetwork::from_str(get(config, "ipv6.address")).ok().map(|n| n.ip());
    (v4, v6)
}

/// Clears the families whose config changed, then applies the newly
/// computed state (§4.4 "Application"). `fan_subnet` is the bridge's
/// computed FAN overlay network, threaded through from the reconciler
/// because it never lands in `new_config` (§4.1, fan mode forbids
/// `ipv4.address`).
pub fn apply(
    firewall: &dyn FirewallApi,
    name: &str,
    old_config: Option<&ConfigMap>,
    new_config: &ConfigMap,
    fan_subnet: Option<Ipv4Network>,
) -> Result<()> {
    let families = changing_families(old_config, new_config);
    firewall.network_clear(name, false, &families)?;
    let opts = compute_opts(new_config, fan_subnet);
    let (v4, v6) = listen_addresses(new_config, fan_subnet);
    firewall.network_setup(name, v4, v6, &opts)
}

/// Tears down every firewall fragment for `name`, including the root
/// chain (§4.4, used on full stop).
pub fn teardown(firewall: &dyn FirewallApi, name: &str) -> Result<()> {
    firewall.network_clear(name, true, &[IpFamily::V4, IpFamily::V6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_firewall_when_address_none() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "none".into());
        assert!(compute_opts(&cfg, None).ipv4_features.is_none());
    }

    #[test]
    fn fan_mode_always_has_v4_firewall() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        let opts = compute_opts(&cfg, None);
        assert!(opts.ipv4_features.unwrap().forwarding_allow);
    }

    #[test]
    fn icmp_dhcp_dns_access_requires_dhcp_and_firewall() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "192.168.1.1/24".into());
        cfg.insert("ipv4.dhcp".into(), "false".into());
        let features = compute_opts(&cfg, None).ipv4_features.unwrap();
        assert!(!features.icmp_dhcp_dns_access);
    }

    #[test]
    fn snat_defaults_to_masquerade() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "192.168.1.1/24".into());
        cfg.insert("ipv4.nat".into(), "true".into());
        let snat = compute_opts(&cfg, None).ipv4_snat.unwrap();
        assert_eq!(snat.snat_address, None);
        assert!(!snat.append);
    }

    #[test]
    fn explicit_nat_address_overrides_masquerade() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "192.168.1.1/24".into());
        cfg.insert("ipv4.nat".into(), "true".into());
        cfg.insert("ipv4.nat.address".into(), "203.0.113.5".into());
        cfg.insert("ipv4.nat.order".into(), "after".into());
        let snat = compute_opts(&cfg, None).ipv4_snat.unwrap();
        assert_eq!(snat.snat_address, Some("203.0.113.5".parse().unwrap()));
        assert!(snat.append);
    }

    #[test]
    fn fan_mode_snat_uses_computed_overlay_subnet() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        cfg.insert("ipv4.nat".into(), "true".into());
        let fan_subnet: Ipv4Network = "250.1.2.1/24".parse().unwrap();
        let snat = compute_opts(&cfg, Some(fan_subnet)).ipv4_snat.unwrap();
        assert_eq!(snat.subnet, IpNetwork::V4(fan_subnet));
    }

    #[test]
    fn fan_mode_snat_none_without_computed_subnet() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        cfg.insert("ipv4.nat".into(), "true".into());
        assert!(compute_opts(&cfg, None).ipv4_snat.is_none());
    }

    #[test]
    fn acl_bit_tracks_security_acls_key() {
        let mut cfg = ConfigMap::new();
        cfg.insert("security.acls".into(), "web,db".into());
        assert!(compute_opts(&cfg, None).acl);
    }

    #[test]
    fn unchanged_config_triggers_no_family_clear() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "192.168.1.1/24".into());
        assert!(changing_families(Some(&cfg), &cfg).is_empty());
    }
}
