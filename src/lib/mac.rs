// SPDX-License-Identifier: Apache-2.0

//! Deterministic MAC derivation (§4.2). Every cluster member that is
//! "cluster safe" for a given network must derive the identical address
//! from the same seed without talking to any other member.

use rand::{RngCore, SeedableRng};
use rand::rngs::SmallRng;

use crate::types::ConfigMap;

/// Whether every cluster member derives the same MAC for this network, or
/// each member must derive its own to avoid L2 conflicts.
pub fn cluster_safe(config: &ConfigMap, external_interfaces_present: bool) -> bool {
    let is_fan = config.get("bridge.mode").map(String::as_str) == Some("fan");
    let ipv4_none = config.get("ipv4.address").map(String::as_str) == Some("none");
    let ipv6_none = config.get("ipv6.address").map(String::as_str) == Some("none");
    let ipless_with_external = external_interfaces_present && ipv4_none && ipv6_none;
    !is_fan && !ipless_with_external
}

/// FNV-1a over the seed string, used only to seed the PRNG (not a
/// cryptographic hash; collisions just mean two networks land on the same
/// starting point, which is harmless).
fn fnv1a(seed: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in seed.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Derives a 6-byte MAC from cluster/network identity. `node_id` is folded
/// into the seed only when `!cluster_safe`, so that safe networks agree
/// across members while unsafe ones diverge.
pub fn derive_mac(
    node_id: u64,
    network_id: u64,
    server_cert_fingerprint: &str,
    cluster_safe: bool,
) -> [u8; 6] {
    let seed_node = if cluster_safe { 0 } else { node_id };
    let seed = format!("{server_cert_fingerprint}.{seed_node}.{network_id}");
    let mut rng = SmallRng::seed_from_u64(fnv1a(&seed));

    loop {
        let mut mac = [0u8; 6];
        rng.fill_bytes(&mut mac);
        let locally_administered = mac[0] & 0b0000_0010 != 0;
        let unicast = mac[0] & 0b0000_0001 == 0;
        if locally_administered && unicast {
            return mac;
        }
    }
}

/// Whether an explicit `bridge.hwaddr` is safe to use verbatim: only
/// meaningful when the network is cluster-safe, since an explicit address
/// on an unsafe network would collide across members just the same as a
/// derived one would, which is the caller's call to reject, not ours.
pub fn check_cluster_wide_mac_safe(cluster_safe: bool) -> bool {
    cluster_safe
}

/// Formats a MAC the way sysfs/iproute2 expect: `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_mac() {
        let a = derive_mac(7, 42, "fingerprint-abc", true);
        let b = derive_mac(7, 42, "fingerprint-abc", true);
        assert_eq!(a, b);
    }

    #[test]
    fn cluster_safe_ignores_node_id() {
        let a = derive_mac(1, 42, "fingerprint-abc", true);
        let b = derive_mac(2, 42, "fingerprint-abc", true);
        assert_eq!(a, b);
    }

    #[test]
    fn cluster_unsafe_diverges_per_node() {
        let a = derive_mac(1, 42, "fingerprint-abc", false);
        let b = derive_mac(2, 42, "fingerprint-abc", false);
        assert_ne!(a, b);
    }

    #[test]
    fn mac_is_locally_administered_and_unicast() {
        let mac = derive_mac(1, 42, "fingerprint-abc", false);
        assert_eq!(mac[0] & 0b0000_0010, 0b0000_0010);
        assert_eq!(mac[0] & 0b0000_0001, 0);
    }

    #[test]
    fn fan_mode_is_not_cluster_safe() {
        let mut cfg = ConfigMap::new();
        cfg.insert("bridge.mode".into(), "fan".into());
        assert!(!cluster_safe(&cfg, false));
    }

    #[test]
    fn ipless_with_external_interfaces_is_not_cluster_safe() {
        let mut cfg = ConfigMap::new();
        cfg.insert("ipv4.address".into(), "none".into());
        cfg.insert("ipv6.address".into(), "none".into());
        assert!(!cluster_safe(&cfg, true));
    }

    #[test]
    fn standard_mode_with_addresses_is_cluster_safe() {
        let cfg = ConfigMap::new();
        assert!(cluster_safe(&cfg, false));
    }

    #[test]
    fn format_mac_is_colon_separated_hex() {
        assert_eq!(format_mac([0x02, 0x00, 0xAB, 0x0c, 0x00, 0x01]), "02:00:ab:0c:00:01");
    }
}
