// SPDX-License-Identifier: Apache-2.0

//! Config map validation, defaulting and "auto" resolution (§4.1).

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use rand::Rng;

use crate::error::{ErrorKind, NetbridgeError, Result};
use crate::types::ConfigMap;

/// Host facts `fill_config` needs in order to resolve `"auto"` values and
/// fan's default underlay. A real binary backs this with netlink queries;
/// tests back it with a fixed fixture.
pub trait HostProbe {
    fn ipv6_enabled(&self) -> bool;
    /// True if no existing route/address on the host overlaps `candidate`.
    fn subnet_is_free(&self, candidate: &IpNetwork) -> bool;
    /// The subnet of the host's current default IPv4 gateway, used as the
    /// FAN underlay when `fan.underlay_subnet` is left on `"auto"`.
    fn default_ipv4_gateway_subnet(&self) -> Option<IpNetwork>;
}

const AUTO_RESOLUTION_ATTEMPTS: u32 = 1000;

fn is_bool(v: &str) -> bool {
    matches!(v, "true" | "false")
}

fn is_truthy(v: &str) -> bool {
    v.is_empty() || v == "true"
}

fn is_network_mtu(v: &str) -> bool {
    v.parse::<u32>().is_ok_and(|m| (68..=65535).contains(&m))
}

fn is_network_mac(v: &str) -> bool {
    let parts: Vec<&str> = v.split(':').collect();
    parts.len() == 6 && parts.iter().all(|p| p.len() == 2 && u8::from_str_radix(p, 16).is_ok())
}

fn is_network_address_v4(v: &str) -> bool {
    matches!(v.parse::<IpAddr>(), Ok(IpAddr::V4(_)))
}

fn is_network_address_v6(v: &str) -> bool {
    matches!(v.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
}

fn is_network_address_cidr_v4(v: &str) -> bool {
    matches!(v.parse::<IpNetwork>(), Ok(IpNetwork::V4(_)))
}

fn is_network_address_cidr_v6(v: &str) -> bool {
    matches!(v.parse::<IpNetwork>(), Ok(IpNetwork::V6(_)))
}

fn is_network_range_v4(v: &str) -> bool {
    is_network_range(v, is_network_address_v4)
}

fn is_network_range_v6(v: &str) -> bool {
    is_network_range(v, is_network_address_v6)
}

fn is_network_range(v: &str, addr_ok: impl Fn(&str) -> bool) -> bool {
    match v.split_once('-') {
        Some((lo, hi)) => {
            addr_ok(lo)
                && addr_ok(hi)
                && lo.parse::<IpAddr>().ok().zip(hi.parse::<IpAddr>().ok())
                    .is_some_and(|(l, h)| l <= h)
        }
        None => false,
    }
}

fn is_list_of(v: &str, p: impl Fn(&str) -> bool) -> bool {
    v.split(',').map(str::trim).all(p)
}

/// One entry of an `ipv4.dhcp.ranges`/`ipv4.ovn.ranges`-style list, parsed
/// to `IpAddr` for overlap comparison.
#[derive(Clone, Copy)]
struct AddrRange {
    lo: IpAddr,
    hi: IpAddr,
}

fn parse_ranges(v: &str) -> Option<Vec<AddrRange>> {
    if v.is_empty() {
        return Some(Vec::new());
    }
    v.split(',')
        .map(|r| {
            let (lo, hi) = r.trim().split_once('-')?;
            Some(AddrRange {
                lo: lo.parse().ok()?,
                hi: hi.parse().ok()?,
            })
        })
        .collect()
}

fn ranges_overlap(a: &[AddrRange], b: &[AddrRange]) -> bool {
    a.iter()
        .any(|x| b.iter().any(|y| x.lo <= y.hi && y.lo <= x.hi))
}

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or("")
}

fn is_fan(config: &ConfigMap) -> bool {
    get(config, "bridge.mode") == "fan"
}

/// Validates a fully filled config map per the per-key predicate table and
/// the seven composite rules. `network_name` feeds the fan name-length and
/// tunnel name-length rules. Returns the first rejected key's error.
pub fn validate(config: &ConfigMap, network_name: &str) -> Result<()> {
    let fan = is_fan(config);

    for key in config.keys() {
        if fan && key.starts_with("ipv4.") && !matches!(
            key.as_str(),
            "ipv4.dhcp.expiry" | "ipv4.firewall" | "ipv4.nat" | "ipv4.nat.order"
        ) && !get(config, key).is_empty()
        {
            return Err(NetbridgeError::validation(
                key,
                "not permitted in fan mode",
            ));
        }
        if fan && key.starts_with("ipv6.") && !get(config, key).is_empty() {
            return Err(NetbridgeError::validation(key, "not permitted in fan mode"));
        }
        if !fan && key.starts_with("fan.") && !get(config, key).is_empty() {
            return Err(NetbridgeError::validation(
                key,
                "only permitted in fan mode",
            ));
        }
    }

    if fan && network_name.len() > 11 {
        return Err(NetbridgeError::validation(
            "name",
            "must be 11 characters or fewer in fan mode",
        ));
    }

    let predicates: [(&str, fn(&str) -> bool); 22] = [
        ("bridge.mac", is_network_mac),
        ("bridge.hwaddr", is_network_mac),
        ("ipv4.address", |v| v == "none" || v == "auto" || is_network_address_cidr_v4(v)),
        ("ipv6.address", |v| v == "none" || v == "auto" || is_network_address_cidr_v6(v)),
        ("ipv4.nat", is_bool),
        ("ipv6.nat", is_bool),
        ("ipv4.nat.order", |v| v == "before" || v == "after"),
        ("ipv6.nat.order", |v| v == "before" || v == "after"),
        ("ipv4.nat.address", is_network_address_v4),
        ("ipv6.nat.address", is_network_address_v6),
        ("ipv4.dhcp", is_bool),
        ("ipv6.dhcp", is_bool),
        ("ipv6.dhcp.stateful", is_bool),
        ("ipv4.dhcp.ranges", |v| is_list_of(v, is_network_range_v4)),
        ("ipv6.dhcp.ranges", |v| is_list_of(v, is_network_range_v6)),
        ("ipv4.ovn.ranges", |v| is_list_of(v, is_network_range_v4)),
        ("ipv6.ovn.ranges", |v| is_list_of(v, is_network_range_v6)),
        ("ipv4.firewall", is_bool),
        ("ipv6.firewall", is_bool),
        ("ipv4.routing", is_bool),
        ("ipv6.routing", is_bool),
        ("bridge.mtu", is_network_mtu),
    ];
    for (key, predicate) in predicates {
        let v = get(config, key);
        if !v.is_empty() && !predicate(v) {
            return Err(NetbridgeError::validation(key, "failed validation"));
        }
    }

    for (net_key, tunnel_name) in config.keys().filter_map(|k| {
        let rest = k.strip_prefix("tunnel.")?;
        let (name, field) = rest.split_once('.')?;
        (field == "protocol").then_some((k.as_str(), name))
    }) {
        if network_name.len() + tunnel_name.len() > 14 {
            return Err(NetbridgeError::validation(
                net_key,
                "tunnel name combined with network name exceeds 14 characters",
            ));
        }
    }

    if let Some(mtu) = config.get("bridge.mtu").filter(|v| !v.is_empty()) {
        let mtu: u32 = mtu
            .parse()
            .map_err(|_| NetbridgeError::validation("bridge.mtu", "not an integer"))?;
        let has_v6 = !matches!(get(config, "ipv6.address"), "" | "none");
        let has_v4 = !matches!(get(config, "ipv4.address"), "" | "none");
        if has_v6 && mtu < 1280 {
            return Err(NetbridgeError::validation(
                "bridge.mtu",
                "must be at least 1280 when IPv6 is configured",
            ));
        }
        if has_v4 && mtu < 68 {
            return Err(NetbridgeError::validation(
                "bridge.mtu",
                "must be at least 68 when IPv4 is configured",
            ));
        }
        if fan {
            let fan_type = get(config, "fan.type");
            let limit = if fan_type == "ipip" { 1480 } else { 1450 };
            if mtu > limit {
                return Err(NetbridgeError::validation(
                    "bridge.mtu",
                    format!("must not exceed {limit} for this fan tunnel type"),
                ));
            }
        }
    }

    if !get(config, "bridge.hwaddr").is_empty() {
        let external = !get(config, "bridge.external_interfaces").is_empty();
        let unsafe_combo = fan
            || (external
                && get(config, "ipv4.address") == "none"
                && get(config, "ipv6.address") == "none");
        if unsafe_combo {
            return Err(NetbridgeError::validation(
                "bridge.hwaddr",
                "cannot be set explicitly: this network is not cluster-MAC-safe",
            ));
        }
    }

    let dhcp4_enabled = is_truthy(get(config, "ipv4.dhcp"));
    if dhcp4_enabled {
        let ovn = parse_ranges(get(config, "ipv4.ovn.ranges"))
            .ok_or_else(|| NetbridgeError::validation("ipv4.ovn.ranges", "malformed"))?;
        if !ovn.is_empty() {
            let dhcp = parse_ranges(get(config, "ipv4.dhcp.ranges"))
                .ok_or_else(|| NetbridgeError::validation("ipv4.dhcp.ranges", "malformed"))?;
            if dhcp.is_empty() {
                return Err(NetbridgeError::validation(
                    "ipv4.ovn.ranges",
                    "requires ipv4.dhcp.ranges to be set",
                ));
            }
            if ranges_overlap(&ovn, &dhcp) {
                return Err(NetbridgeError::conflict("ipv4.dhcp.ranges"));
            }
        }
    }

    let dhcp6_stateful = is_truthy(get(config, "ipv6.dhcp.stateful"));
    if dhcp6_stateful {
        let ovn = parse_ranges(get(config, "ipv6.ovn.ranges"))
            .ok_or_else(|| NetbridgeError::validation("ipv6.ovn.ranges", "malformed"))?;
        if !ovn.is_empty() {
            let dhcp = parse_ranges(get(config, "ipv6.dhcp.ranges"))
                .ok_or_else(|| NetbridgeError::validation("ipv6.dhcp.ranges", "malformed"))?;
            if dhcp.is_empty() {
                return Err(NetbridgeError::validation(
                    "ipv6.ovn.ranges",
                    "requires ipv6.dhcp.ranges to be set",
                ));
            }
            if ranges_overlap(&ovn, &dhcp) {
                return Err(NetbridgeError::conflict("ipv6.dhcp.ranges"));
            }
        }
    }

    Ok(())
}

/// Applies fill defaults and resolves `"auto"` values, re-running
/// `validate` afterwards.
pub fn fill_config(config: &mut ConfigMap, network_name: &str, host: &dyn HostProbe) -> Result<()> {
    if is_fan(config) {
        if get(config, "fan.underlay_subnet").is_empty() {
            config.insert("fan.underlay_subnet".into(), "auto".into());
        }
        if get(config, "ipv4.nat").is_empty() {
            config.insert("ipv4.nat".into(), "true".into());
        }
    } else {
        if get(config, "ipv4.address").is_empty() {
            config.insert("ipv4.address".into(), "auto".into());
        }
        if get(config, "ipv4.address") == "auto" && get(config, "ipv4.nat").is_empty() {
            config.insert("ipv4.nat".into(), "true".into());
        }
        if get(config, "ipv6.address").is_empty() && host.ipv6_enabled() {
            config.insert("ipv6.address".into(), "auto".into());
            if get(config, "ipv6.nat").is_empty() {
                config.insert("ipv6.nat".into(), "true".into());
            }
        }
    }

    if get(config, "dns.mode").is_empty() {
        config.insert("dns.mode".into(), "managed".into());
    }
    if get(config, "dns.domain").is_empty() {
        config.insert("dns.domain".into(), "lxd".into());
    }
    if get(config, "ipv4.dhcp.expiry").is_empty() {
        config.insert("ipv4.dhcp.expiry".into(), "1h".into());
    }
    if get(config, "ipv6.dhcp.expiry").is_empty() {
        config.insert("ipv6.dhcp.expiry".into(), "1h".into());
    }

    resolve_auto(config, host)?;
    validate(config, network_name)
}

fn resolve_auto(config: &mut ConfigMap, host: &dyn HostProbe) -> Result<()> {
    if get(config, "ipv4.address") == "auto" {
        let net = random_private_v4_slash24(host)?;
        config.insert("ipv4.address".into(), net.to_string());
    }
    if get(config, "ipv6.address") == "auto" {
        let net = random_ula_v6_slash64(host)?;
        config.insert("ipv6.address".into(), net.to_string());
    }
    if get(config, "fan.underlay_subnet") == "auto" {
        let net = host.default_ipv4_gateway_subnet().ok_or_else(|| {
            NetbridgeError::new(
                ErrorKind::Precondition,
                "no default IPv4 gateway to derive a fan underlay from",
            )
        })?;
        config.insert("fan.underlay_subnet".into(), net.to_string());
    }
    Ok(())
}

fn random_private_v4_slash24(host: &dyn HostProbe) -> Result<IpNetwork> {
    let mut rng = rand::thread_rng();
    for _ in 0..AUTO_RESOLUTION_ATTEMPTS {
        let second: u8 = rng.gen();
        let third: u8 = rng.gen();
        let candidate = IpNetwork::from_str(&format!("10.{second}.{third}.0/24")).unwrap();
        if host.subnet_is_free(&candidate) {
            return Ok(candidate);
        }
    }
    Err(NetbridgeError::new(
        ErrorKind::TransientIo,
        "exhausted attempts choosing a free IPv4 subnet",
    ))
}

fn random_ula_v6_slash64(host: &dyn HostProbe) -> Result<IpNetwork> {
    let mut rng = rand::thread_rng();
    for _ in 0..AUTO_RESOLUTION_ATTEMPTS {
        let mut groups = [0u16; 4];
        rng.fill(&mut groups);
        let candidate = IpNetwork::from_str(&format!(
            "fd{:02x}:{:04x}:{:04x}:{:04x}::/64",
            rng.gen::<u8>(),
            groups[0],
            groups[1],
            groups[2],
        ))
        .unwrap();
        if host.subnet_is_free(&candidate) {
            return Ok(candidate);
        }
    }
    Err(NetbridgeError::new(
        ErrorKind::TransientIo,
        "exhausted attempts choosing a free IPv6 subnet",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FixtureHost {
        ipv6_enabled: bool,
        used: Mutex<HashSet<IpNetwork>>,
        gateway_subnet: Option<IpNetwork>,
    }

    impl HostProbe for FixtureHost {
        fn ipv6_enabled(&self) -> bool {
            self.ipv6_enabled
        }

        fn subnet_is_free(&self, candidate: &IpNetwork) -> bool {
            !self.used.lock().unwrap().contains(candidate)
        }

        fn default_ipv4_gateway_subnet(&self) -> Option<IpNetwork> {
            self.gateway_subnet
        }
    }

    fn host() -> FixtureHost {
        FixtureHost {
            ipv6_enabled: false,
            used: Mutex::new(HashSet::new()),
            gateway_subnet: Some(IpNetwork::from_str("203.0.113.0/24").unwrap()),
        }
    }

    #[test]
    fn fan_mode_rejects_ipv6_keys() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        cfg.insert("ipv6.address".into(), "auto".into());
        assert_eq!(validate(&cfg, "br0").unwrap_err().kind, ErrorKind::Validation);
    }

    #[test]
    fn non_fan_mode_rejects_fan_keys() {
        let mut cfg = ConfigMap::new();
        cfg.insert("fan.type".into(), "vxlan".into());
        assert_eq!(validate(&cfg, "br0").unwrap_err().kind, ErrorKind::Validation);
    }

    #[test]
    fn mtu_rejected_below_v6_minimum() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv6.address".into(), "fd00::1/64".into());
        cfg.insert("bridge.mtu".into(), "1200".into());
        assert!(validate(&cfg, "br0").is_err());
    }

    #[test]
    fn ovn_ranges_require_dhcp_ranges() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.ovn.ranges".into(), "10.0.0.100-10.0.0.150".into());
        assert!(validate(&cfg, "br0").is_err());
    }

    #[test]
    fn ovn_and_dhcp_ranges_must_not_overlap() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.dhcp.ranges".into(), "10.0.0.100-10.0.0.200".into());
        cfg.insert("ipv4.ovn.ranges".into(), "10.0.0.150-10.0.0.160".into());
        assert_eq!(validate(&cfg, "br0").unwrap_err().kind, ErrorKind::Conflict);
    }

    #[test]
    fn fill_resolves_auto_ipv4_address() {
        let mut cfg = ConfigMap::new();
        fill_config(&mut cfg, "br0", &host()).unwrap();
        assert!(get(&cfg, "ipv4.address").parse::<IpNetwork>().is_ok());
        assert_eq!(get(&cfg, "ipv4.nat"), "true");
    }

    #[test]
    fn fill_leaves_ipv6_unset_when_kernel_disabled() {
        let mut cfg = ConfigMap::new();
        fill_config(&mut cfg, "br0", &host()).unwrap();
        assert!(get(&cfg, "ipv6.address").is_empty());
    }

    #[test]
    fn fan_fill_resolves_underlay_from_gateway() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        fill_config(&mut cfg, "br0", &host()).unwrap();
        assert_eq!(get(&cfg, "fan.underlay_subnet"), "203.0.113.0/24");
    }

    #[test]
    fn fill_applies_documented_defaults() {
        let mut cfg = ConfigMap::new();
        fill_config(&mut cfg, "br0", &host()).unwrap();
        assert_eq!(get(&cfg, "dns.mode"), "managed");
        assert_eq!(get(&cfg, "dns.domain"), "lxd");
        assert_eq!(get(&cfg, "ipv4.dhcp.expiry"), "1h");
        assert_eq!(get(&cfg, "ipv6.dhcp.expiry"), "1h");
    }

    #[test]
    fn fill_preserves_explicit_dns_and_expiry_settings() {
        let mut cfg = ConfigMap::new();
        cfg.insert("dns.mode".into(), "none".into());
        cfg.insert("dns.domain".into(), "example.net".into());
        cfg.insert("ipv4.dhcp.expiry".into(), "4h".into());
        fill_config(&mut cfg, "br0", &host()).unwrap();
        assert_eq!(get(&cfg, "dns.mode"), "none");
        assert_eq!(get(&cfg, "dns.domain"), "example.net");
        assert_eq!(get(&cfg, "ipv4.dhcp.expiry"), "4h");
    }
}
