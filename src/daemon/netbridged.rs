// SPDX-License-Identifier: Apache-2.0

//! The `netbridged` daemon: loads `DaemonConfig`, wires the concrete
//! collaborator backends, and dispatches inbound requests from a
//! JSON-framed Unix socket onto a fresh worker thread each (§5, §10.3).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

use netbridge::collaborators::{
    AppArmorApi, BgpSpeakerApi, ClusterDb, ClusterNotifier, Collaborators, FirewallApi, NetlinkApi, OvsApi,
    ResolverApi, ResolverHandle,
};
use netbridge::config::HostProbe;
use netbridge::error::{ErrorKind, NetbridgeError, Result};
use netbridge::lifecycle;
use netbridge::resolver::{ArgvPlan, FamilyPlan};
use netbridge::types::{ConfigMap, ExternalSubnetUsage, Network, NetworkStatus};

#[derive(Debug, Deserialize)]
struct DaemonConfig {
    var_dir: String,
    log_dir: String,
    node_id: u64,
    node_name: String,
    server_cert_fingerprint: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            var_dir: "/var/lib/netbridge".into(),
            log_dir: "/var/log/netbridge".into(),
            node_id: 1,
            node_name: "node1".into(),
            server_cert_fingerprint: "unset".into(),
        }
    }
}

fn load_config(path: &str) -> DaemonConfig {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text).unwrap_or_else(|e| {
            log::error!(target: "netbridge::daemon", "failed to parse '{path}': {e}, using defaults");
            DaemonConfig::default()
        }),
        Err(_) => {
            log::warn!(target: "netbridge::daemon", "no config at '{path}', using defaults");
            DaemonConfig::default()
        }
    }
}

fn enable_logging() {
    let mut builder = env_logger::Builder::new();
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    builder.parse_filters(&level);
    builder.init();
}

/// A process-wide no-op BGP speaker: real advertisement is out of scope
/// (§1), but the daemon still needs something behind the trait object.
struct NoopBgp;

impl BgpSpeakerApi for NoopBgp {
    fn advertise_network(&self, name: &str, prefixes: &[ipnetwork::IpNetwork]) -> Result<()> {
        log::debug!(target: "netbridge::daemon", "bgp advertise '{name}': {prefixes:?}");
        Ok(())
    }
    fn withdraw_network(&self, name: &str) -> Result<()> {
        log::debug!(target: "netbridge::daemon", "bgp withdraw '{name}'");
        Ok(())
    }
    fn advertise_forward(&self, listen_address: std::net::IpAddr) -> Result<()> {
        log::debug!(target: "netbridge::daemon", "bgp advertise forward {listen_address}");
        Ok(())
    }
    fn withdraw_forward(&self, listen_address: std::net::IpAddr) -> Result<()> {
        log::debug!(target: "netbridge::daemon", "bgp withdraw forward {listen_address}");
        Ok(())
    }
}

/// A single-node stand-in for the cluster database and heartbeat
/// notifier, both contract-only per §1: the real cluster integration is
/// out of scope, so this just reflects this node back to itself.
struct SingleNodeCluster {
    node_name: String,
}

impl ClusterDb for SingleNodeCluster {
    fn external_subnet_usages(&self) -> Result<Vec<ExternalSubnetUsage>> {
        Ok(Vec::new())
    }
    fn acl_exists(&self, _project: &str, _name: &str) -> Result<bool> {
        Ok(false)
    }
    fn zone_name_is_unique(&self, _project: &str, _zone: &str) -> Result<bool> {
        Ok(true)
    }
}

impl ClusterNotifier for SingleNodeCluster {
    fn cluster_member_addresses(&self, _location_filter: &[String]) -> Result<Vec<std::net::IpAddr>> {
        Ok(Vec::new())
    }
    fn node_is_evacuated(&self, node: &str) -> Result<bool> {
        Ok(node != self.node_name)
    }
}

struct NetlinkHostProbe<'a>(&'a dyn NetlinkApi);

impl HostProbe for NetlinkHostProbe<'_> {
    fn ipv6_enabled(&self) -> bool {
        std::path::Path::new("/proc/net/if_inet6").exists()
    }
    fn subnet_is_free(&self, candidate: &ipnetwork::IpNetwork) -> bool {
        self.0.subnet_is_free(candidate).unwrap_or(false)
    }
    fn default_ipv4_gateway_subnet(&self) -> Option<ipnetwork::IpNetwork> {
        self.0.default_ipv4_gateway_subnet().ok().flatten()
    }
}

#[derive(Clone)]
struct Backends {
    netlink: Arc<dyn NetlinkApi>,
    ovs: Arc<dyn OvsApi>,
    firewall: Arc<dyn FirewallApi>,
    resolver: Arc<dyn ResolverApi>,
    apparmor: Arc<dyn AppArmorApi>,
    bgp: Arc<dyn BgpSpeakerApi>,
    cluster_db: Arc<dyn ClusterDb>,
    cluster_notifier: Arc<dyn ClusterNotifier>,
    mock_mode: bool,
}

impl Backends {
    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            netlink: &*self.netlink,
            ovs: &*self.ovs,
            firewall: &*self.firewall,
            resolver: &*self.resolver,
            apparmor: &*self.apparmor,
            bgp: &*self.bgp,
            cluster_db: &*self.cluster_db,
            cluster_notifier: &*self.cluster_notifier,
            mock_mode: self.mock_mode,
        }
    }
}

#[derive(Default)]
struct Registry {
    networks: Mutex<HashMap<String, Network>>,
    forwards: Mutex<HashMap<String, Vec<netbridge::types::AddressForward>>>,
    /// Serialises `Apply`/`Update`/`Stop`/`Forward` per network name (§5):
    /// `Show`/`Lease` deliberately don't take this lock and see best-effort
    /// snapshots instead.
    network_locks: netbridge::lock::NetworkLockRegistry,
}

/// Owns the `dnsmasq`/`forkdns` child handles `reconciler::setup` cannot
/// hold onto across requests (§4.3 steps 18-19): started right after a
/// successful `Apply`, stopped right before a network's `Stop`.
#[derive(Default)]
struct ResolverSupervisor {
    handles: Mutex<HashMap<String, Vec<Box<dyn ResolverHandle>>>>,
}

impl ResolverSupervisor {
    fn adopt(&self, network: &str, handles: Vec<Box<dyn ResolverHandle>>) {
        if handles.is_empty() {
            return;
        }
        self.handles.lock().unwrap().insert(network.to_string(), handles);
    }

    fn stop(&self, network: &str) {
        if let Some(mut handles) = self.handles.lock().unwrap().remove(network) {
            for mut handle in handles.drain(..) {
                if let Err(e) = handle.stop() {
                    log::warn!(target: "netbridge::daemon", "stopping resolver for '{network}' failed: {e}");
                }
            }
        }
    }
}

fn get(config: &ConfigMap, key: &str) -> &str {
    config.get(key).map(String::as_str).unwrap_or("")
}

fn parse_dhcp_ranges(v: &str) -> Vec<(IpAddr, IpAddr)> {
    v.split(',')
        .filter(|r| !r.trim().is_empty())
        .filter_map(|r| {
            let (lo, hi) = r.trim().split_once('-')?;
            Some((lo.parse().ok()?, hi.parse().ok()?))
        })
        .collect()
}

fn family_plan(
    config: &ConfigMap,
    family_prefix: &str,
    fan_network_v4: Option<ipnetwork::Ipv4Network>,
) -> Option<FamilyPlan> {
    let is_fan = get(config, "bridge.mode") == "fan";
    let (gateway, subnet) = if family_prefix == "ipv4" && is_fan {
        // §4.3 step 15: the fan overlay address is computed from live host
        // state inside `reconciler::setup`, not stored back into `config`.
        let fan_network_v4 = fan_network_v4?;
        (IpAddr::V4(fan_network_v4.ip()), Some(fan_network_v4))
    } else {
        let address_key = format!("{family_prefix}.address");
        let address = get(config, &address_key);
        if matches!(address, "" | "none") {
            return None;
        }
        let network = IpNetwork::from_str(address).ok()?;
        let subnet = match network {
            IpNetwork::V4(v4) => Some(v4),
            IpNetwork::V6(_) => None,
        };
        (network.ip(), subnet)
    };
    let dhcp_enabled = get(config, &format!("{family_prefix}.dhcp")) != "false";
    let dhcp_ranges = parse_dhcp_ranges(get(config, &format!("{family_prefix}.dhcp.ranges")));
    let dhcp_expiry = get(config, &format!("{family_prefix}.dhcp.expiry")).to_string();
    Some(FamilyPlan {
        gateway,
        subnet,
        dhcp_enabled,
        dhcp_ranges,
        dhcp_expiry,
        is_first_family_with_dhcp: family_prefix == "ipv4",
        stateful_dhcpv6: get(config, "ipv6.dhcp.stateful") == "true",
    })
}

/// Starts `dnsmasq` for `network` when its config needs a resolver,
/// applying the `--dhcp-ignore-names` flag decided by `dns.mode` (§4.5).
fn start_resolvers(
    backends: &Backends,
    cfg: &DaemonConfig,
    net: &Network,
    outcome: netbridge::reconciler::SetupOutcome,
) -> Result<Vec<Box<dyn ResolverHandle>>> {
    if !netbridge::resolver::resolver_needed(&net.config) {
        return Ok(Vec::new());
    }
    if !backends.resolver.dnsmasq_binary_present() {
        return Err(NetbridgeError::new(ErrorKind::Precondition, "dnsmasq binary not found on PATH"));
    }

    let network_dir = format!("{}/networks/{}", cfg.var_dir, net.name);
    std::fs::create_dir_all(&network_dir)
        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;

    let version = backends.resolver.dnsmasq_version()?;
    let dns_mode = get(&net.config, "dns.mode");
    let domain = get(&net.config, "dns.domain");
    let plan = ArgvPlan {
        bridge: &net.name,
        network_dir: &network_dir,
        version,
        debug: false,
        dns_mode,
        domain,
        dns_search: "",
        clustered: net.locations.len() > 1,
        overlay_for_rev_server: None,
        raw_dnsmasq: get(&net.config, "raw.dnsmasq"),
        mtu_for_option26: get(&net.config, "bridge.mtu").parse().ok(),
        ipv4: family_plan(&net.config, "ipv4", outcome.fan_network_v4),
        ipv6: family_plan(&net.config, "ipv6", outcome.fan_network_v4),
    };

    let mut argv = netbridge::resolver::build_dnsmasq_argv(&plan);
    if let Some(flag) = netbridge::resolver::dhcp_ignore_names_flag(dns_mode) {
        argv.push(flag.to_string());
    }

    let pid_file = format!("{network_dir}/dnsmasq.pid");
    let handle = netbridge::resolver::start_dnsmasq(backends.resolver.as_ref(), &argv, &network_dir, &pid_file)?;
    Ok(vec![handle])
}

/// Applies the firewall options/ACLs and BGP advertisement `reconciler`
/// leaves to the caller (§4.3 step 20).
fn apply_network_policy(
    backends: &Backends,
    net: &Network,
    outcome: netbridge::reconciler::SetupOutcome,
) -> Result<()> {
    netbridge::firewall::apply(backends.firewall.as_ref(), &net.name, None, &net.config, outcome.fan_network_v4)?;

    let acl_names: Vec<String> = get(&net.config, "security.acls")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if !acl_names.is_empty() {
        backends.firewall.apply_acls(&net.name, &acl_names)?;
    }

    let prefixes: Vec<IpNetwork> = ["ipv4.address", "ipv6.address"]
        .iter()
        .filter_map(|key| IpNetwork::from_str(get(&net.config, key)).ok())
        .collect();
    if !prefixes.is_empty() {
        backends.bgp.advertise_network(&net.name, &prefixes)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Ping,
    Show {
        network: String,
    },
    Apply {
        network: String,
        project: String,
        config: netbridge::types::ConfigMap,
    },
    Update {
        network: String,
        config: netbridge::types::ConfigMap,
    },
    Rename {
        network: String,
        new_name: String,
    },
    Stop {
        network: String,
    },
    Forward {
        network: String,
        listen_address: std::net::IpAddr,
        target_address: Option<std::net::IpAddr>,
    },
    Lease {
        network: String,
    },
    Heartbeat {
        network: String,
        peer_addresses: Vec<std::net::IpAddr>,
    },
}

#[derive(Serialize)]
struct Response {
    ok: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<Network>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into(), network: None }
    }
    fn err(e: &NetbridgeError) -> Self {
        Self { ok: false, message: format!("{:?}: {}", e.kind, e.msg), network: None }
    }
}

fn handle_request(
    req: Request,
    cfg: &DaemonConfig,
    backends: &Backends,
    registry: &Registry,
    resolvers: &ResolverSupervisor,
) -> Response {
    match req {
        Request::Ping => Response::ok("pong"),
        Request::Show { network } => {
            let networks = registry.networks.lock().unwrap();
            match networks.get(&network) {
                Some(net) => Response { ok: true, message: String::new(), network: Some(net.clone()) },
                None => Response { ok: false, message: format!("no such network '{network}'"), network: None },
            }
        }
        Request::Apply { network, project, config } => registry.network_locks.with_lock(&network.clone(), || {
            let mut net = Network {
                project_name: project,
                id: stable_id(&network),
                name: network.clone(),
                description: String::new(),
                status: NetworkStatus::Pending,
                local_status: HashMap::new(),
                config,
                locations: vec![cfg.node_name.clone()],
            };
            let probe = NetlinkHostProbe(&*backends.netlink);
            let result = lifecycle::create(&probe, &*backends.netlink, &mut net)
                .and_then(|()| {
                    let collabs = backends.collaborators();
                    lifecycle::start(
                        &collabs,
                        &cfg.var_dir,
                        cfg.node_id,
                        &cfg.server_cert_fingerprint,
                        &mut net,
                        &cfg.node_name,
                    )
                })
                .and_then(|outcome| apply_network_policy(backends, &net, outcome).map(|()| outcome))
                .and_then(|outcome| {
                    let started = start_resolvers(backends, cfg, &net, outcome)?;
                    resolvers.adopt(&net.name, started);
                    Ok(())
                });
            let response = match result {
                Ok(()) => Response { ok: true, message: "applied".into(), network: Some(net.clone()) },
                Err(e) => Response::err(&e),
            };
            registry.networks.lock().unwrap().insert(network, net);
            response
        }),
        Request::Update { network, mut config } => registry.network_locks.with_lock(&network.clone(), || {
            let Some(old_net) = registry.networks.lock().unwrap().get(&network).cloned() else {
                return Response { ok: false, message: format!("no such network '{network}'"), network: None };
            };
            let probe = NetlinkHostProbe(&*backends.netlink);
            let materialised = old_net.is_globally_created();
            let fill_and_validate = netbridge::config::fill_config(&mut config, &network, &probe)
                .and_then(|()| netbridge::config::validate(&config, &network));
            if let Err(e) = fill_and_validate {
                return Response::err(&e);
            }

            let plan = lifecycle::plan_update(&old_net.config, &config, materialised);
            let mut net = old_net.clone();
            net.config = config;

            let result: Result<()> = if plan.db_only {
                Ok(())
            } else {
                (|| {
                    for iface in &plan.detach_external {
                        if let Err(e) = backends.netlink.detach_from_bridge(iface) {
                            log::warn!(
                                target: "netbridge::daemon",
                                "detaching external interface '{iface}' from '{network}' failed: {e}"
                            );
                        }
                    }
                    if plan.must_stop_bridge {
                        resolvers.stop(&network);
                        let collabs = backends.collaborators();
                        lifecycle::stop(&collabs, &mut net, &cfg.node_name)?;
                    }
                    let collabs = backends.collaborators();
                    let outcome = lifecycle::apply_update(
                        &collabs,
                        &cfg.var_dir,
                        cfg.node_id,
                        &cfg.server_cert_fingerprint,
                        &mut net,
                        old_net.config.clone(),
                    )?;
                    apply_network_policy(backends, &net, outcome)?;
                    resolvers.stop(&network);
                    let started = start_resolvers(backends, cfg, &net, outcome)?;
                    resolvers.adopt(&net.name, started);
                    Ok(())
                })()
            };
            let response = match &result {
                Ok(()) => Response { ok: true, message: "updated".into(), network: Some(net.clone()) },
                Err(e) => Response::err(e),
            };
            registry.networks.lock().unwrap().insert(network, net);
            response
        }),
        Request::Rename { network, new_name } => registry.network_locks.with_lock(&network.clone(), || {
            let Some(mut net) = registry.networks.lock().unwrap().remove(&network) else {
                return Response { ok: false, message: format!("no such network '{network}'"), network: None };
            };
            if let Err(e) = lifecycle::validate_rename(&*backends.netlink, &new_name) {
                let response = Response::err(&e);
                registry.networks.lock().unwrap().insert(network, net);
                return response;
            }

            resolvers.stop(&network);
            let collabs = backends.collaborators();
            let result: Result<()> = lifecycle::stop(&collabs, &mut net, &cfg.node_name).and_then(|()| {
                let old_dir = format!("{}/networks/{}", cfg.var_dir, network);
                let new_dir = format!("{}/networks/{}", cfg.var_dir, new_name);
                if std::path::Path::new(&old_dir).exists() {
                    std::fs::rename(&old_dir, &new_dir)
                        .map_err(|e| NetbridgeError::new(ErrorKind::TransientIo, e.to_string()))?;
                }
                let old_log = netbridge::resolver::forkdns_log_path(&cfg.log_dir, &network);
                let new_log = netbridge::resolver::forkdns_log_path(&cfg.log_dir, &new_name);
                std::fs::rename(&old_log, &new_log).ok();

                net.name = new_name.clone();
                lifecycle::start(
                    &collabs,
                    &cfg.var_dir,
                    cfg.node_id,
                    &cfg.server_cert_fingerprint,
                    &mut net,
                    &cfg.node_name,
                )
                .and_then(|outcome| apply_network_policy(backends, &net, outcome).map(|()| outcome))
                .and_then(|outcome| {
                    let started = start_resolvers(backends, cfg, &net, outcome)?;
                    resolvers.adopt(&net.name, started);
                    Ok(())
                })
            });

            let response = match &result {
                Ok(()) => Response { ok: true, message: "renamed".into(), network: Some(net.clone()) },
                Err(e) => Response::err(e),
            };
            registry.networks.lock().unwrap().insert(net.name.clone(), net);
            response
        }),
        Request::Stop { network } => registry.network_locks.with_lock(&network, || {
            let mut networks = registry.networks.lock().unwrap();
            let Some(net) = networks.get_mut(&network) else {
                return Response { ok: false, message: format!("no such network '{network}'"), network: None };
            };
            resolvers.stop(&network);
            let collabs = backends.collaborators();
            match lifecycle::stop(&collabs, net, &cfg.node_name) {
                Ok(()) => Response::ok("stopped"),
                Err(e) => Response::err(&e),
            }
        }),
        Request::Forward { network, listen_address, target_address } => registry.network_locks.with_lock(&network, || {
            let networks = registry.networks.lock().unwrap();
            let Some(net) = networks.get(&network) else {
                return Response { ok: false, message: format!("no such network '{network}'"), network: None };
            };
            if let Err(e) = netbridge::forward::validate_listen_address(Some(listen_address), &net.config) {
                return Response::err(&e);
            }
            let usages = match backends.cluster_db.external_subnet_usages() {
                Ok(u) => u,
                Err(e) => return Response::err(&e),
            };
            let mut forwards = registry.forwards.lock().unwrap();
            let existing = forwards.entry(network.clone()).or_default();
            if let Err(e) = netbridge::forward::check_conflict(listen_address, &net.name, &usages, existing.as_slice()) {
                return Response::err(&e);
            }
            let record = netbridge::types::AddressForward {
                network_id: net.id,
                member_id: cfg.node_name.clone(),
                listen_address,
                description: String::new(),
                target_address,
                port_maps: Vec::new(),
            };
            existing.push(record);
            if let Err(e) = netbridge::forward::apply_forwards(backends.firewall.as_ref(), &network, existing.as_slice()) {
                return Response::err(&e);
            }
            Response::ok("forward created")
        }),
        Request::Lease { network } => {
            let path = format!("{}/networks/{network}/dnsmasq.leases", cfg.var_dir);
            match std::fs::read_to_string(&path) {
                Ok(contents) => Response::ok(contents),
                Err(e) => Response::ok(format!("no leases recorded ({e})")),
            }
        }
        Request::Heartbeat { network, mut peer_addresses } => {
            let path = format!("{}/networks/{network}/forkdns.servers", cfg.var_dir);
            let lock = netbridge::lock::ForkdnsFileLock::new();
            match netbridge::resolver::handle_heartbeat(&lock, &path, &mut peer_addresses) {
                Ok(rewritten) => Response::ok(if rewritten { "rewritten" } else { "unchanged" }),
                Err(e) => Response::err(&e),
            }
        }
    }
}

fn stable_id(name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

fn serve_connection(
    stream: UnixStream,
    cfg: Arc<DaemonConfig>,
    backends: Backends,
    registry: Arc<Registry>,
    resolvers: Arc<ResolverSupervisor>,
) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone unix stream"));
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                log::warn!(target: "netbridge::daemon", "read error: {e}");
                return;
            }
        }
        let response = match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(req) => handle_request(req, &cfg, &backends, &registry, &resolvers),
            Err(e) => Response { ok: false, message: format!("bad request: {e}"), network: None },
        };
        let mut body = serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
        body.push('\n');
        if writer.write_all(body.as_bytes()).is_err() {
            return;
        }
    }
}

fn main() {
    enable_logging();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "/etc/netbridge/daemon.yaml".into());
    let cfg = Arc::new(load_config(&config_path));

    std::fs::create_dir_all(&cfg.var_dir).ok();
    std::fs::create_dir_all(&cfg.log_dir).ok();

    let netlink: Arc<dyn NetlinkApi> = match netbridge_netlink::RtNetlink::new() {
        Ok(n) => Arc::new(n),
        Err(e) => {
            log::error!(target: "netbridge::daemon", "failed to open netlink socket: {e}");
            std::process::exit(1);
        }
    };

    let backends = Backends {
        netlink,
        ovs: Arc::new(netbridge_netlink::OvsVsctl),
        firewall: Arc::new(netbridge_firewall::Nftables::new()),
        resolver: Arc::new(netbridge_resolver::ProcessResolver::new()),
        apparmor: Arc::new(netbridge_resolver::AppArmorParser::new()),
        bgp: Arc::new(NoopBgp),
        cluster_db: Arc::new(SingleNodeCluster { node_name: cfg.node_name.clone() }),
        cluster_notifier: Arc::new(SingleNodeCluster { node_name: cfg.node_name.clone() }),
        mock_mode: false,
    };

    let registry = Arc::new(Registry::default());
    let resolvers = Arc::new(ResolverSupervisor::default());
    let socket_path = format!("{}/netbridged.sock", cfg.var_dir);
    std::fs::remove_file(&socket_path).ok();
    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            log::error!(target: "netbridge::daemon", "failed to bind '{socket_path}': {e}");
            std::process::exit(1);
        }
    };
    log::info!(target: "netbridge::daemon", "listening on {socket_path}");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let cfg = Arc::clone(&cfg);
                let backends = backends.clone();
                let registry = Arc::clone(&registry);
                let resolvers = Arc::clone(&resolvers);
                std::thread::spawn(move || serve_connection(stream, cfg, backends, registry, resolvers));
            }
            Err(e) => log::warn!(target: "netbridge::daemon", "accept failed: {e}"),
        }
    }
}
