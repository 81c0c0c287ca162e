// SPDX-License-Identifier: Apache-2.0

//! Builds `dnsmasq`/`forkdns` argument vectors and supervises their
//! process lifecycle (§4.5).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnetwork::Ipv4Network;

use crate::collaborators::{AppArmorApi, ResolverApi, ResolverHandle};
use crate::error::{ErrorKind, NetbridgeError, Result};
use crate::lock::ForkdnsFileLock;
use crate::types::ConfigMap;

pub const START_DEADLINE: Duration = Duration::from_millis(500);

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or("")
}

fn truthy_or_empty(v: &str) -> bool {
    v.is_empty() || v == "true"
}

/// Per-family inputs to argv construction, already resolved by the
/// reconciler (gateway address, dhcp range, etc).
pub struct FamilyPlan {
    pub gateway: IpAddr,
    /// The v4 subnet `gateway` sits in, used to compute the default DHCP
    /// range (§4.5) when `dhcp.ranges` is unset. `None` for ipv6 plans.
    pub subnet: Option<Ipv4Network>,
    pub dhcp_enabled: bool,
    pub dhcp_ranges: Vec<(IpAddr, IpAddr)>,
    pub dhcp_expiry: String,
    pub is_first_family_with_dhcp: bool,
    pub stateful_dhcpv6: bool,
}

/// The default DHCP pool for a subnet with no explicit `dhcp.ranges`: the
/// gateway's `.2` through the subnet's second-to-last address, e.g.
/// `10.0.42.1/24` -> `10.0.42.2,10.0.42.254`.
fn default_dhcp_range(subnet: Ipv4Network) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let lo = u32::from(subnet.network()).checked_add(2)?;
    let hi = u32::from(subnet.broadcast()).checked_sub(1)?;
    (lo <= hi).then(|| (Ipv4Addr::from(lo), Ipv4Addr::from(hi)))
}

pub struct ArgvPlan<'a> {
    pub bridge: &'a str,
    pub network_dir: &'a str,
    pub version: (u32, u32),
    pub debug: bool,
    pub dns_mode: &'a str,
    pub domain: &'a str,
    pub dns_search: &'a str,
    pub clustered: bool,
    pub overlay_for_rev_server: Option<&'a str>,
    pub raw_dnsmasq: &'a str,
    pub mtu_for_option26: Option<u32>,
    pub ipv4: Option<FamilyPlan>,
    pub ipv6: Option<FamilyPlan>,
}

/// Builds the full `dnsmasq` argv (§4.5 "Argv construction" +
/// "Per-family args" + "DNS args" + "Raw include").
pub fn build_dnsmasq_argv(plan: &ArgvPlan) -> Vec<String> {
    let mut argv = vec![
        "--keep-in-foreground".to_string(),
        "--strict-order".to_string(),
        "--bind-interfaces".to_string(),
        "--except-interface=lo".to_string(),
        "--pid-file=".to_string(),
        "--no-ping".to_string(),
        format!("--interface={}", plan.bridge),
    ];

    let (major, minor) = plan.version;
    let at_least = |want_major: u32, want_minor: u32| {
        major > want_major || (major == want_major && minor > want_minor)
    };

    if at_least(2, 79) {
        argv.push("--dhcp-rapid-commit".into());
    }
    if at_least(2, 47) {
        argv.push("--no-negcache".into());
    }
    if at_least(2, 81) {
        argv.push("--dhcp-ignore-clid".into());
    }
    if !plan.debug && at_least(2, 67) {
        argv.push("--quiet-dhcp".into());
        argv.push("--quiet-dhcp6".into());
        argv.push("--quiet-ra".into());
    }

    let mut dhcp_seen = false;
    if let Some(v4) = &plan.ipv4 {
        argv.push(format!("--listen-address={}", v4.gateway));
        if v4.dhcp_enabled {
            if !dhcp_seen {
                argv.push("--dhcp-no-override".into());
                argv.push("--dhcp-authoritative".into());
                argv.push(format!("--dhcp-leasefile={}/dnsmasq.leases", plan.network_dir));
                argv.push(format!("--dhcp-hostsfile={}/dnsmasq.hosts", plan.network_dir));
                dhcp_seen = true;
            }
            argv.push(format!("--dhcp-option-force=3,{}", v4.gateway));
            if let Some(mtu) = plan.mtu_for_option26 {
                argv.push(format!("--dhcp-option-force=26,{mtu}"));
            }
            if !plan.dns_search.is_empty() {
                argv.push(format!("--dhcp-option-force=119,{}", plan.dns_search));
            }
            if v4.dhcp_ranges.is_empty() {
                match v4.subnet.and_then(default_dhcp_range) {
                    Some((lo, hi)) => argv.push(format!("--dhcp-range={lo},{hi},{}", v4.dhcp_expiry)),
                    None => argv.push(format!(
                        "--dhcp-range={},{},{}",
                        v4.gateway, v4.gateway, v4.dhcp_expiry
                    )),
                }
            } else {
                for (lo, hi) in &v4.dhcp_ranges {
                    argv.push(format!("--dhcp-range={lo},{hi},{}", v4.dhcp_expiry));
                }
            }
        }
    }

    if let Some(v6) = &plan.ipv6 {
        argv.push(format!("--listen-address={}", v6.gateway));
        argv.push("--enable-ra".into());
        if v6.dhcp_enabled {
            if !dhcp_seen {
                argv.push("--dhcp-no-override".into());
                argv.push("--dhcp-authoritative".into());
                argv.push(format!("--dhcp-leasefile={}/dnsmasq.leases", plan.network_dir));
                argv.push(format!("--dhcp-hostsfile={}/dnsmasq.hosts", plan.network_dir));
                dhcp_seen = true;
            }
            let mode = if v6.stateful_dhcpv6 { "" } else { ",ra-only" };
            for (lo, hi) in &v6.dhcp_ranges {
                argv.push(format!("--dhcp-range={lo},{hi},{}{mode}", v6.dhcp_expiry));
            }
        }
    }

    if plan.dns_mode != "none" {
        argv.push("-s".into());
        argv.push(plan.domain.to_string());
        argv.push(format!("--interface-name=_gateway.{},{}", plan.domain, plan.bridge));
        if plan.clustered {
            if let (Some(overlay), Some(v4)) = (plan.overlay_for_rev_server, &plan.ipv4) {
                argv.push(format!("-S/{}/{}#1053", plan.domain, v4.gateway));
                argv.push(format!("--rev-server={overlay},{}#1053", v4.gateway));
            }
        } else {
            argv.push(format!("-S/{}/", plan.domain));
        }
    }

    if !plan.raw_dnsmasq.is_empty() {
        argv.push(format!("--conf-file={}/dnsmasq.raw", plan.network_dir));
    }

    argv
}

/// Writes `networks/<name>/dnsmasq.raw` and decides whether the AppArmor
/// profile stays enabled: per §4.5, a non-empty `raw.dnsmasq` disables
/// confinement and must be logged.
pub fn apply_raw_config(
    resolver: &dyn ResolverApi,
    apparmor: &dyn AppArmorApi,
    network_name: &str,
    network_dir: &str,
    raw_dnsmasq: &str,
    profile_source: &str,
) -> Result<bool> {
    let _ = resolver;
    std::fs::write(format!("{network_dir}/dnsmasq.raw"), format!("{raw_dnsmasq}\n"))
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;

    if raw_dnsmasq.is_empty() {
        apparmor.load_profile(network_name, profile_source)?;
        Ok(true)
    } else {
        log::warn!(
            target: "netbridge::resolver",
            "AppArmor confinement disabled for network '{network_name}': raw.dnsmasq is set"
        );
        Ok(false)
    }
}

/// Starts `dnsmasq`, enforcing the 500 ms deadline and PID-persist
/// contract from §4.5. A deadline-exceeded wait result means the child is
/// alive and is the success path; anything else is a failure, and the
/// stderr tail is only read after the wait resolves.
pub fn start_dnsmasq(
    resolver: &dyn ResolverApi,
    argv: &[String],
    network_dir: &str,
    pid_file: &str,
) -> Result<Box<dyn ResolverHandle>> {
    if !resolver.dnsmasq_binary_present() {
        return Err(NetbridgeError::new(
            ErrorKind::Precondition,
            "dnsmasq binary not found on PATH",
        ));
    }

    let handle = resolver.start_dnsmasq(argv, network_dir)?;
    match handle.is_alive() {
        Ok(true) => {}
        Ok(false) => {
            let tail = handle.stderr_tail();
            return Err(NetbridgeError::new(
                ErrorKind::Supervision,
                format!("dnsmasq exited immediately: {tail}"),
            ));
        }
        Err(e) => return Err(e),
    }

    if let Err(e) = std::fs::write(pid_file, handle.pid().to_string()) {
        let mut handle = handle;
        let stop_err = handle.stop().err();
        let mut msg = format!("failed to persist dnsmasq PID file: {e}");
        if let Some(stop_err) = stop_err {
            msg.push_str(&format!(" (and stop failed: {stop_err})"));
        }
        return Err(NetbridgeError::new(ErrorKind::TransientIo, msg));
    }

    Ok(handle)
}

/// Builds the `forkdns <address>:1053 <domain> <network>` argv (§4.5
/// "Clustered forwarder").
pub fn build_forkdns_argv(address: IpAddr, domain: &str, network_name: &str) -> Vec<String> {
    vec![
        format!("{address}:1053"),
        domain.to_string(),
        network_name.to_string(),
    ]
}

/// Normalises the per-network forkdns log path to an absolute
/// `<log>/forkdns.<name>.log`, per the resolved open question in §9:
/// always absolute and normalised, regardless of how `log_dir` was given.
pub fn forkdns_log_path(log_dir: &str, network_name: &str) -> String {
    let absolute = if log_dir.starts_with('/') {
        log_dir.to_string()
    } else {
        format!("/{log_dir}")
    };
    format!("{}/forkdns.{network_name}.log", absolute.trim_end_matches('/'))
}

/// Atomically rewrites the forkdns servers list file: write to `.tmp`,
/// fsync, rename. Serialised process-wide by `ForkdnsFileLock`.
pub fn write_servers_file_atomic(
    lock: &ForkdnsFileLock,
    path: &str,
    servers: &[IpAddr],
) -> Result<()> {
    let _guard = lock.lock();
    let tmp_path = format!("{path}.tmp");
    let contents = servers
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    let contents = if contents.is_empty() {
        String::new()
    } else {
        format!("{contents}\n")
    };

    use std::io::Write;
    let mut file = std::fs::File::create(&tmp_path)
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    file.sync_all()
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
    Ok(())
}

/// Reads the current servers file (if any), diffs it against the freshly
/// queried peer list and rewrites only when the two differ (§4.5
/// "Heartbeat integration").
pub fn handle_heartbeat(
    lock: &ForkdnsFileLock,
    path: &str,
    peer_addresses: &mut Vec<IpAddr>,
) -> Result<bool> {
    peer_addresses.sort();
    peer_addresses.dedup();

    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let existing: Vec<IpAddr> = existing
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();

    if existing == *peer_addresses {
        return Ok(false);
    }
    write_servers_file_atomic(lock, path, peer_addresses)?;
    Ok(true)
}

/// `bridge.mode=fan` and any network with at least one IP family
/// configured both need a resolver; a network with both families
/// `"none"` and not fan does not (§4.3 step 19).
pub fn resolver_needed(config: &ConfigMap) -> bool {
    get(config, "bridge.mode") == "fan"
        || !matches!(get(config, "ipv4.address"), "" | "none")
        || !matches!(get(config, "ipv6.address"), "" | "none")
}

/// Whether `--dhcp-ignore-names` should be added, per the resolved open
/// question in §9: `managed` adds it, `dynamic` omits it.
pub fn dhcp_ignore_names_flag(dns_mode: &str) -> Option<&'static str> {
    match dns_mode {
        "managed" => Some("--dhcp-ignore-names"),
        _ => None,
    }
}

pub fn dns_ipv4_nat_truthy(config: &ConfigMap) -> bool {
    truthy_or_empty(get(config, "ipv4.nat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_needed_for_fan_even_without_addresses() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        cfg.insert("ipv4.address".into(), "none".into());
        cfg.insert("ipv6.address".into(), "none".into());
        assert!(resolver_needed(&cfg));
    }

    #[test]
    fn resolver_not_needed_when_ipless_and_not_fan() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "none".into());
        cfg.insert("ipv6.address".into(), "none".into());
        assert!(!resolver_needed(&cfg));
    }

    #[test]
    fn managed_dns_mode_adds_ignore_names() {
        assert_eq!(dhcp_ignore_names_flag("managed"), Some("--dhcp-ignore-names"));
        assert_eq!(dhcp_ignore_names_flag("dynamic"), None);
    }

    #[test]
    fn forkdns_log_path_is_always_absolute() {
        assert_eq!(forkdns_log_path("var/log", "br0"), "/var/log/forkdns.br0.log");
        assert_eq!(forkdns_log_path("/var/log", "br0"), "/var/log/forkdns.br0.log");
    }

    #[test]
    fn dnsmasq_argv_includes_base_flags() {
        let plan = ArgvPlan {
            bridge: "br0",
            network_dir: "/var/lib/netbridge/networks/br0",
            version: (2, 90),
            debug: false,
            dns_mode: "managed",
            domain: "lxd",
            dns_search: "",
            clustered: false,
            overlay_for_rev_server: None,
            raw_dnsmasq: "",
            mtu_for_option26: None,
            ipv4: Some(FamilyPlan {
                gateway: "10.0.0.1".parse().unwrap(),
                subnet: Some("10.0.0.1/24".parse().unwrap()),
                dhcp_enabled: true,
                dhcp_ranges: vec![],
                dhcp_expiry: "1h".into(),
                is_first_family_with_dhcp: true,
                stateful_dhcpv6: false,
            }),
            ipv6: None,
        };
        let argv = build_dnsmasq_argv(&plan);
        assert!(argv.contains(&"--interface=br0".to_string()));
        assert!(argv.contains(&"--dhcp-rapid-commit".to_string()));
        assert!(argv.iter().any(|a| a.starts_with("--dhcp-range=10.0.0.2,10.0.0.254,1h")));
    }

    #[test]
    fn default_dhcp_range_excludes_network_broadcast_and_gateway() {
        let subnet: Ipv4Network = "10.0.42.1/24".parse().unwrap();
        assert_eq!(
            default_dhcp_range(subnet),
            Some(("10.0.42.2".parse().unwrap(), "10.0.42.254".parse().unwrap()))
        );
    }

    #[test]
    fn default_dhcp_range_none_for_tiny_subnet() {
        let subnet: Ipv4Network = "10.0.42.1/31".parse().unwrap();
        assert_eq!(default_dhcp_range(subnet), None);
    }

    #[test]
    fn heartbeat_skips_rewrite_when_unchanged() {
        let dir = std::env::temp_dir().join(format!("netbridge-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("servers").to_string_lossy().to_string();
        let lock = ForkdnsFileLock::new();
        let mut addrs = vec!["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()];
        assert!(handle_heartbeat(&lock, &path, &mut addrs.clone()).unwrap());
        assert!(!handle_heartbeat(&lock, &path, &mut addrs).unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }
}
