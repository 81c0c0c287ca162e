// SPDX-License-Identifier: Apache-2.0

//! Netlink-backed `NetlinkApi` and a shell-out `OvsApi`, grounded in the
//! `rtnetlink`/`netlink-packet-route` usage in `plugin_baize::link` and the
//! `sysctl` wrapper pattern from the wider pack (§10.5). Every public
//! method here is synchronous: the core crate runs on blocking worker
//! threads (§5), so this backend parks one single-threaded Tokio runtime
//! and blocks the calling thread on each netlink round trip rather than
//! exposing `async fn` across the `NetlinkApi` trait boundary.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;
use std::sync::OnceLock;

use futures_util::TryStreamExt;
use ipnetwork::IpNetwork;
use netbridge::collaborators::{BridgeDriver, IpFamily, NetlinkApi, OvsApi, Route};
use netbridge::error::{ErrorKind, NetbridgeError, Result};
use netlink_packet_route::address::{AddressAttribute, AddressScope};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteProtocol, RouteScope};
use rtnetlink::Handle;
use tokio::runtime::Runtime;

fn runtime() -> &'static Runtime {
    static RT: OnceLock<Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to start netlink runtime")
    })
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    runtime().block_on(fut)
}

fn io_err(context: &str, e: impl std::fmt::Display) -> NetbridgeError {
    NetbridgeError::new(ErrorKind::TransientIo, format!("{context}: {e}"))
}

/// A live netlink connection. Cloning `Handle` is cheap (it is itself a
/// channel handle), so one `RtNetlink` can back every network's
/// collaborators.
pub struct RtNetlink {
    handle: Handle,
}

impl RtNetlink {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| io_err("opening netlink socket", e))?;
        runtime().spawn(connection);
        Ok(Self { handle })
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn require_index(&self, name: &str) -> Result<u32> {
        self.link_index(name)
            .await?
            .ok_or_else(|| NetbridgeError::new(ErrorKind::Precondition, format!("no such interface '{name}'")))
    }

    async fn all_link_names(&self) -> Result<Vec<String>> {
        let mut stream = self.handle.link().get().execute();
        let mut names = Vec::new();
        while let Ok(Some(msg)) = stream.try_next().await {
            for attr in &msg.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    names.push(name.clone());
                }
            }
        }
        Ok(names)
    }
}

impl NetlinkApi for RtNetlink {
    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(block_on(self.link_index(name))?.is_some())
    }

    fn create_bridge(&self, name: &str, driver: BridgeDriver, mac: [u8; 6], mtu: u32) -> Result<()> {
        match driver {
            BridgeDriver::OpenVSwitch => {
                ovs_vsctl(&["add-br", name])?;
            }
            BridgeDriver::Native => {
                block_on(self.handle.link().add().bridge(name.to_string()).execute())
                    .map_err(|e| io_err(&format!("creating bridge '{name}'"), e))?;
            }
        }
        self.set_link_mtu(name, mtu)?;
        self.set_link_mac(name, mac)?;
        Ok(())
    }

    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        block_on(async {
            let index = self.require_index(name).await?;
            self.handle
                .link()
                .set(index)
                .mtu(mtu)
                .execute()
                .await
                .map_err(|e| io_err(&format!("setting mtu on '{name}'"), e))
        })
    }

    fn set_link_mac(&self, name: &str, mac: [u8; 6]) -> Result<()> {
        block_on(async {
            let index = self.require_index(name).await?;
            self.handle
                .link()
                .set(index)
                .address(mac.to_vec())
                .execute()
                .await
                .map_err(|e| io_err(&format!("setting mac on '{name}'"), e))
        })
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        block_on(async {
            let index = self.require_index(name).await?;
            self.handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| io_err(&format!("bringing up '{name}'"), e))
        })
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        block_on(async {
            let Some(index) = self.link_index(name).await? else {
                return Ok(());
            };
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| io_err(&format!("deleting '{name}'"), e))
        })
    }

    fn links_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let names = block_on(self.all_link_names())?;
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }

    fn attach_to_bridge(&self, bridge: &str, iface: &str) -> Result<()> {
        block_on(async {
            let bridge_index = self.require_index(bridge).await?;
            let iface_index = self.require_index(iface).await?;
            self.handle
                .link()
                .set(iface_index)
                .controller(bridge_index)
                .execute()
                .await
                .map_err(|e| io_err(&format!("attaching '{iface}' to '{bridge}'"), e))
        })
    }

    fn detach_from_bridge(&self, iface: &str) -> Result<()> {
        block_on(async {
            let iface_index = self.require_index(iface).await?;
            self.handle
                .link()
                .set(iface_index)
                .nocontroller()
                .execute()
                .await
                .map_err(|e| io_err(&format!("detaching '{iface}' from its bridge"), e))
        })
    }

    fn enable_vlan_filtering(&self, bridge: &str) -> Result<()> {
        run_ip(&["link", "set", "dev", bridge, "type", "bridge", "vlan_filtering", "1"])
    }

    fn has_global_unicast_address(&self, iface: &str) -> Result<bool> {
        block_on(async {
            let index = self.require_index(iface).await?;
            let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
            while let Ok(Some(msg)) = addrs.try_next().await {
                if msg.header.scope == AddressScope::Universe {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    fn add_address(&self, iface: &str, addr: IpNetwork) -> Result<()> {
        block_on(async {
            let index = self.require_index(iface).await?;
            self.handle
                .address()
                .add(index, addr.ip(), addr.prefix())
                .execute()
                .await
                .map_err(|e| io_err(&format!("adding address {addr} to '{iface}'"), e))
        })
    }

    fn flush_addresses(&self, iface: &str, family: IpFamily) -> Result<()> {
        block_on(async {
            let index = self.require_index(iface).await?;
            let mut addrs = self.handle.address().get().set_link_index_filter(index).execute();
            let mut to_delete = Vec::new();
            while let Ok(Some(msg)) = addrs.try_next().await {
                let matches_family = match family {
                    IpFamily::V4 => msg.header.family == netlink_packet_route::AddressFamily::Inet,
                    IpFamily::V6 => msg.header.family == netlink_packet_route::AddressFamily::Inet6,
                };
                if matches_family {
                    to_delete.push(msg);
                }
            }
            for msg in to_delete {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| io_err(&format!("flushing addresses on '{iface}'"), e))?;
            }
            Ok(())
        })
    }

    fn snapshot_boot_routes(&self, iface: &str, family: IpFamily) -> Result<Vec<Route>> {
        block_on(async {
            let index = self.require_index(iface).await?;
            Ok(self
                .routes_for(index, family)
                .await?
                .into_iter()
                .filter(|(msg, _, _)| msg.header.protocol == RouteProtocol::Boot)
                .map(|(_, dest, gateway)| Route { destination: dest, gateway })
                .collect())
        })
    }

    fn flush_static_routes(&self, iface: &str, family: IpFamily) -> Result<()> {
        block_on(async {
            let index = self.require_index(iface).await?;
            let routes = self.routes_for(index, family).await?;
            for (msg, _, _) in routes
                .into_iter()
                .filter(|(m, _, _)| m.header.protocol != RouteProtocol::Kernel)
            {
                self.handle
                    .route()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| io_err(&format!("flushing routes on '{iface}'"), e))?;
            }
            Ok(())
        })
    }

    fn add_route(&self, iface: &str, route: &Route) -> Result<()> {
        let dest = route.destination.to_string();
        let mut args = vec!["route".to_string(), "replace".to_string(), dest];
        if let Some(gw) = route.gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }
        args.push("dev".into());
        args.push(iface.to_string());
        run_ip(&args.iter().map(String::as_str).collect::<Vec<_>>())
    }

    fn create_ipip_tunnel(&self, name: &str, local_map: &str) -> Result<()> {
        run_ip(&["link", "add", name, "type", "ipip", "external", "fan-map", local_map])
    }

    fn create_vxlan_tunnel(&self, name: &str, vni: u32, remote: Option<IpAddr>) -> Result<()> {
        let vni_str = vni.to_string();
        let mut args = vec!["link", "add", name, "type", "vxlan", "id", &vni_str, "dstport", "0"];
        let remote_str;
        if let Some(remote) = remote {
            remote_str = remote.to_string();
            args.push("remote");
            args.push(&remote_str);
        }
        run_ip(&args)
    }

    fn create_gre_tunnel(&self, name: &str, local: IpAddr, remote: IpAddr) -> Result<()> {
        let local = local.to_string();
        let remote = remote.to_string();
        run_ip(&["link", "add", name, "type", "gretap", "local", &local, "remote", &remote])
    }

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        let ctl = sysctl::Ctl::new(key).map_err(|e| io_err(&format!("sysctl '{key}'"), e))?;
        ctl.set_value_string(value)
            .map_err(|e| io_err(&format!("setting sysctl '{key}'"), e))?;
        Ok(())
    }

    fn sysctl_get(&self, key: &str) -> Result<String> {
        let ctl = sysctl::Ctl::new(key).map_err(|e| io_err(&format!("sysctl '{key}'"), e))?;
        ctl.value_string().map_err(|e| io_err(&format!("reading sysctl '{key}'"), e))
    }

    fn subnet_is_free(&self, candidate: &IpNetwork) -> Result<bool> {
        block_on(async {
            let mut links = self.handle.link().get().execute();
            while let Ok(Some(link)) = links.try_next().await {
                let mut addrs = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(link.header.index)
                    .execute();
                while let Ok(Some(addr_msg)) = addrs.try_next().await {
                    for attr in &addr_msg.attributes {
                        if let AddressAttribute::Address(ip) = attr {
                            if let Ok(existing) = IpNetwork::new(*ip, addr_msg.header.prefix_len) {
                                if candidate.overlaps(existing) {
                                    return Ok(false);
                                }
                            }
                        }
                    }
                }
            }
            Ok(true)
        })
    }

    fn default_ipv4_gateway_subnet(&self) -> Result<Option<IpNetwork>> {
        block_on(async {
            let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
            let mut gateway = None;
            while let Ok(Some(route)) = routes.try_next().await {
                if route.header.scope != RouteScope::Universe {
                    continue;
                }
                let has_destination = route
                    .attributes
                    .iter()
                    .any(|a| matches!(a, RouteAttribute::Destination(_)));
                if has_destination {
                    continue;
                }
                for attr in &route.attributes {
                    if let RouteAttribute::Gateway(RouteAddress::Inet(addr)) = attr {
                        gateway = Some(*addr);
                    }
                }
            }
            let Some(gateway) = gateway else { return Ok(None) };

            let mut links = self.handle.link().get().execute();
            while let Ok(Some(link)) = links.try_next().await {
                let mut addrs = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(link.header.index)
                    .execute();
                while let Ok(Some(addr_msg)) = addrs.try_next().await {
                    for attr in &addr_msg.attributes {
                        if let AddressAttribute::Address(IpAddr::V4(ip)) = attr {
                            if let Ok(net) = IpNetwork::new(IpAddr::V4(*ip), addr_msg.header.prefix_len) {
                                if net.contains(IpAddr::V4(gateway)) {
                                    return Ok(Some(net));
                                }
                            }
                        }
                    }
                }
            }
            Ok(None)
        })
    }

    fn first_host_address_in(&self, underlay: &IpNetwork) -> Result<Option<IpAddr>> {
        block_on(async {
            let mut links = self.handle.link().get().execute();
            while let Ok(Some(link)) = links.try_next().await {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                });
                if name.as_deref() == Some("lo") {
                    continue;
                }
                let mut addrs = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(link.header.index)
                    .execute();
                while let Ok(Some(addr_msg)) = addrs.try_next().await {
                    for attr in &addr_msg.attributes {
                        if let AddressAttribute::Address(ip) = attr {
                            if underlay.contains(*ip) {
                                return Ok(Some(*ip));
                            }
                        }
                    }
                }
            }
            Ok(None)
        })
    }
}

impl RtNetlink {
    /// Every route attached to `index` matching `family`, alongside its
    /// parsed destination and gateway (used by both the boot-route
    /// snapshot and the static-route flush).
    async fn routes_for(
        &self,
        index: u32,
        family: IpFamily,
    ) -> Result<Vec<(netlink_packet_route::route::RouteMessage, IpNetwork, Option<IpAddr>)>> {
        let version = match family {
            IpFamily::V4 => rtnetlink::IpVersion::V4,
            IpFamily::V6 => rtnetlink::IpVersion::V6,
        };
        let mut routes = self.handle.route().get(version).execute();
        let mut out = Vec::new();
        while let Ok(Some(msg)) = routes.try_next().await {
            let oif = msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Oif(i) => Some(*i),
                _ => None,
            });
            if oif != Some(index) {
                continue;
            }
            let dest = msg
                .attributes
                .iter()
                .find_map(|a| match a {
                    RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
                        IpNetwork::new(IpAddr::V4(*ip), msg.header.destination_prefix_length).ok()
                    }
                    RouteAttribute::Destination(RouteAddress::Inet6(ip)) => {
                        IpNetwork::new(IpAddr::V6(*ip), msg.header.destination_prefix_length).ok()
                    }
                    _ => None,
                })
                .unwrap_or_else(|| default_network(family));
            let gateway = msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                _ => None,
            });
            out.push((msg, dest, gateway));
        }
        Ok(out)
    }
}

fn default_network(family: IpFamily) -> IpNetwork {
    match family {
        IpFamily::V4 => IpNetwork::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).unwrap(),
        IpFamily::V6 => IpNetwork::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).unwrap(),
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    run_command("ip", args)
}

fn ovs_vsctl(args: &[&str]) -> Result<()> {
    run_command("ovs-vsctl", args)
}

fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| io_err(&format!("spawning '{program}'"), e))?;
    if !output.status.success() {
        return Err(NetbridgeError::new(
            ErrorKind::TransientIo,
            format!(
                "'{program} {}' failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

/// OpenVSwitch bridge management, shelling out to `ovs-vsctl` since no
/// crate wraps the OVS control socket; the same approach this backend
/// uses for uncommon tunnel link kinds and that `netbridge-resolver` uses
/// for `apparmor_parser`.
pub struct OvsVsctl;

impl OvsApi for OvsVsctl {
    fn bridge_exists(&self, name: &str) -> Result<bool> {
        let output = Command::new("ovs-vsctl")
            .args(["br-exists", name])
            .output()
            .map_err(|e| io_err("spawning 'ovs-vsctl'", e))?;
        Ok(output.status.success())
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        ovs_vsctl(&["--may-exist", "add-br", name])
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        ovs_vsctl(&["--if-exists", "del-br", name])
    }

    fn attach_port(&self, bridge: &str, port: &str) -> Result<()> {
        ovs_vsctl(&["--may-exist", "add-port", bridge, port])
    }
}
