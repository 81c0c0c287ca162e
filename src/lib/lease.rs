// SPDX-License-Identifier: Apache-2.0

//! Merges static config, synthesised IPv6 and dynamic lease-file records
//! into one lease list (§4.7).

use std::net::{IpAddr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::types::{Lease, LeaseType};

/// A downstream network naming this one as its uplink, contributing a
/// `LeaseType::Uplink` record.
pub struct UplinkNetwork {
    pub name: String,
    pub location: String,
    pub project: String,
    pub address: IpAddr,
}

/// A single instance NIC with a static address, contributing a
/// `LeaseType::Static` record.
pub struct StaticNic {
    pub hostname: String,
    pub address: IpAddr,
    pub hwaddr: [u8; 6],
    pub location: String,
    pub project: String,
}

/// A NIC eligible for EUI-64 synthesis: has a MAC and sits on a
/// non-stateful IPv6 subnet.
pub struct Eui64Nic {
    pub hostname: String,
    pub subnet: IpNetwork,
    pub hwaddr: [u8; 6],
    pub location: String,
    pub project: String,
}

/// Computes the EUI-64 interface identifier for `mac` and splices it into
/// `subnet`'s /64 prefix.
pub fn eui64_address(subnet: &IpNetwork, mac: [u8; 6]) -> Option<Ipv6Addr> {
    let IpNetwork::V6(v6) = subnet else {
        return None;
    };
    if v6.prefix() > 64 {
        return None;
    }
    let mut eui = [0u8; 8];
    eui[0] = mac[0] ^ 0b0000_0010;
    eui[1] = mac[1];
    eui[2] = mac[2];
    eui[3] = 0xff;
    eui[4] = 0xfe;
    eui[5] = mac[3];
    eui[6] = mac[4];
    eui[7] = mac[5];

    let prefix = v6.ip().octets();
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&prefix[..8]);
    out[8..].copy_from_slice(&eui);
    Some(Ipv6Addr::from(out))
}

/// One line of a dnsmasq-style lease file: `expiry mac ip hostname clid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicLeaseRecord {
    pub address: IpAddr,
    pub hostname: String,
    pub hwaddr: Option<[u8; 6]>,
}

fn parse_mac(field: &str) -> Option<[u8; 6]> {
    let candidate = if field.len() > 17 {
        &field[field.len() - 17..]
    } else {
        field
    };
    let parts: Vec<&str> = candidate.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(mac)
}

/// Parses a dnsmasq lease file's contents into dynamic lease records.
/// IPv6 leases never carry a MAC back (the resolver cannot reconstruct
/// it), matching the resolver's own limitation.
pub fn parse_lease_file(contents: &str) -> Vec<DynamicLeaseRecord> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(address) = fields[2].parse::<IpAddr>() else {
            continue;
        };
        let hostname = fields[3].to_string();
        let hwaddr = if address.is_ipv6() {
            None
        } else {
            parse_mac(fields[1]).or_else(|| fields.get(4).and_then(|clid| parse_mac(clid)))
        };
        out.push(DynamicLeaseRecord {
            address,
            hostname,
            hwaddr,
        });
    }
    out
}

/// Merges every lease source into one flat list, in the order given in
/// §4.7 (gateway, uplink, static, EUI-64, dynamic, peer).
#[derive(Default)]
pub struct LeaseAggregator {
    gateways: Vec<(IpAddr, String, String)>,
    uplinks: Vec<UplinkNetwork>,
    statics: Vec<StaticNic>,
    eui64: Vec<Eui64Nic>,
    dynamic: Vec<DynamicLeaseRecord>,
    dynamic_location: String,
    dynamic_project: String,
    peer_leases: Vec<Lease>,
}

impl LeaseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_gateway(&mut self, address: IpAddr, location: &str, project: &str) -> &mut Self {
        self.gateways.push((address, location.to_string(), project.to_string()));
        self
    }

    pub fn add_uplink(&mut self, uplink: UplinkNetwork) -> &mut Self {
        self.uplinks.push(uplink);
        self
    }

    pub fn add_static(&mut self, nic: StaticNic) -> &mut Self {
        self.statics.push(nic);
        self
    }

    pub fn add_eui64_candidate(&mut self, nic: Eui64Nic) -> &mut Self {
        self.eui64.push(nic);
        self
    }

    pub fn set_dynamic_leases(
        &mut self,
        records: Vec<DynamicLeaseRecord>,
        location: &str,
        project: &str,
    ) -> &mut Self {
        self.dynamic = records;
        self.dynamic_location = location.to_string();
        self.dynamic_project = project.to_string();
        self
    }

    pub fn add_peer_leases(&mut self, leases: Vec<Lease>) -> &mut Self {
        self.peer_leases.extend(leases);
        self
    }

    /// Merges every source. `requesting_project` filters dynamic and peer
    /// leases to MACs known in that project when `internal_call` is
    /// false; an internal (cluster-forwarded) call gets everything back
    /// unfiltered, since the forwarder filters on behalf of its caller.
    pub fn merge(&self, requesting_project: &str, internal_call: bool) -> Vec<Lease> {
        let mut out = Vec::new();

        for (address, location, project) in &self.gateways {
            out.push(Lease {
                hostname: String::new(),
                address: *address,
                hwaddr: None,
                lease_type: LeaseType::Gateway,
                location: location.clone(),
                project: project.clone(),
            });
        }

        for uplink in &self.uplinks {
            out.push(Lease {
                hostname: uplink.name.clone(),
                address: uplink.address,
                hwaddr: None,
                lease_type: LeaseType::Uplink,
                location: uplink.location.clone(),
                project: uplink.project.clone(),
            });
        }

        for nic in &self.statics {
            out.push(Lease {
                hostname: nic.hostname.clone(),
                address: nic.address,
                hwaddr: Some(nic.hwaddr),
                lease_type: LeaseType::Static,
                location: nic.location.clone(),
                project: nic.project.clone(),
            });
        }

        for nic in &self.eui64 {
            if let Some(addr) = eui64_address(&nic.subnet, nic.hwaddr) {
                out.push(Lease {
                    hostname: nic.hostname.clone(),
                    address: IpAddr::V6(addr),
                    hwaddr: Some(nic.hwaddr),
                    lease_type: LeaseType::Dynamic,
                    location: nic.location.clone(),
                    project: nic.project.clone(),
                });
            }
        }

        let known_macs: std::collections::HashSet<[u8; 6]> = self
            .statics
            .iter()
            .filter(|n| n.project == requesting_project)
            .map(|n| n.hwaddr)
            .collect();

        for record in &self.dynamic {
            if !internal_call {
                let Some(mac) = record.hwaddr else { continue };
                if !known_macs.contains(&mac) {
                    continue;
                }
            }
            out.push(Lease {
                hostname: record.hostname.clone(),
                address: record.address,
                hwaddr: record.hwaddr,
                lease_type: LeaseType::Dynamic,
                location: self.dynamic_location.clone(),
                project: self.dynamic_project.clone(),
            });
        }

        for lease in &self.peer_leases {
            if internal_call || lease.project == requesting_project {
                out.push(lease.clone());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui64_splices_mac_into_prefix() {
        let subnet: IpNetwork = "fd00:1234:5678::/64".parse().unwrap();
        let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
        let addr = eui64_address(&subnet, mac).unwrap();
        assert_eq!(addr.segments()[0], 0xfd00);
        assert_eq!(addr.segments()[4], 0x0011);
        assert_eq!(addr.segments()[7], 0x4455);
    }

    #[test]
    fn lease_file_parses_v4_and_v6() {
        let contents = "1700000000 02:aa:bb:cc:dd:ee 10.0.0.5 host1 *\n\
                         1700000001 00:03:00:01:02:aa:bb:cc:dd:ee fd00::5 host2 *\n";
        let leases = parse_lease_file(contents);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hwaddr, Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
        assert_eq!(leases[1].hwaddr, None);
    }

    #[test]
    fn merge_filters_dynamic_leases_for_external_callers() {
        let mut agg = LeaseAggregator::new();
        agg.add_static(StaticNic {
            hostname: "known".into(),
            address: "10.0.0.9".parse().unwrap(),
            hwaddr: [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee],
            location: "node1".into(),
            project: "default".into(),
        });
        agg.set_dynamic_leases(
            vec![
                DynamicLeaseRecord {
                    address: "10.0.0.5".parse().unwrap(),
                    hostname: "known".into(),
                    hwaddr: Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]),
                },
                DynamicLeaseRecord {
                    address: "10.0.0.6".parse().unwrap(),
                    hostname: "unknown".into(),
                    hwaddr: Some([0x02, 0xff, 0xff, 0xff, 0xff, 0xff]),
                },
            ],
            "node1",
            "default",
        );
        let leases = agg.merge("default", false);
        let hostnames: Vec<_> = leases.iter().map(|l| l.hostname.as_str()).collect();
        assert!(hostnames.contains(&"known"));
        assert!(!hostnames.contains(&"unknown"));
    }

    #[test]
    fn internal_call_gets_unfiltered_dynamic_leases() {
        let mut agg = LeaseAggregator::new();
        agg.set_dynamic_leases(
            vec![DynamicLeaseRecord {
                address: "10.0.0.6".parse().unwrap(),
                hostname: "unknown".into(),
                hwaddr: Some([0x02, 0xff, 0xff, 0xff, 0xff, 0xff]),
            }],
            "node1",
            "default",
        );
        let leases = agg.merge("default", true);
        assert_eq!(leases.len(), 1);
    }
}
