// SPDX-License-Identifier: Apache-2.0

//! FAN overlay address computation (§4.3.1).

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{ErrorKind, NetbridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanTunnelType {
    Ipip,
    Vxlan,
}

impl FanTunnelType {
    pub fn mtu(self) -> u32 {
        match self {
            Self::Ipip => 1480,
            Self::Vxlan => 1450,
        }
    }
}

/// Computes the bridge's FAN overlay address given the underlay `U/m` the
/// host sits in, the cluster-wide overlay `O/n`, and the host's address
/// `H` inside the underlay (§4.3.1). The splice is table-driven by `n`
/// (the only two supported overlay widths), copying `O`'s network byte(s)
/// into the high octets and `H`'s low octet(s) into the rest, with the
/// last byte fixed to 1:
///
/// - `/8` overlay: `[O[0], H[2], H[3], 1]`
/// - `/16` overlay: `[O[0], O[1], H[3], 1]` (only valid with a `/24` underlay)
///
/// `n + (32-m) + 8` must not exceed 32, and only `m ∈ {16,24}`, `n ∈
/// {8,16}` are supported.
pub fn compute_fan_address(overlay: Ipv4Network, underlay: Ipv4Network, host: Ipv4Addr) -> Result<Ipv4Addr> {
    let n = overlay.prefix();
    let m = underlay.prefix();
    if !matches!(m, 16 | 24) || !matches!(n, 8 | 16) {
        return Err(NetbridgeError::new(
            ErrorKind::Validation,
            "fan overlay must be /8 or /16 and underlay must be /16 or /24",
        ));
    }
    if u32::from(n) + (32 - u32::from(m)) + 8 > 32 {
        return Err(NetbridgeError::new(
            ErrorKind::Validation,
            format!("fan overlay /{n} and underlay /{m} do not fit the 32-bit FAN layout"),
        ));
    }

    let o = overlay.ip().octets();
    let h = host.octets();
    let addr = match n {
        8 => [o[0], h[2], h[3], 1],
        16 => [o[0], o[1], h[3], 1],
        _ => unreachable!("validated above"),
    };
    Ok(Ipv4Addr::from(addr))
}

/// The overlay prefix length to assign on the bridge: `/n` normally, or a
/// flat `/24` when tunnelling over `ipip` (§4.3.1).
pub fn bridge_overlay_prefix(overlay: Ipv4Network, tunnel: FanTunnelType) -> u8 {
    match tunnel {
        FanTunnelType::Ipip => 24,
        FanTunnelType::Vxlan => overlay.prefix(),
    }
}

/// The vxlan VNI derived from the overlay's high byte, shifted into a
/// 24-bit identifier.
pub fn vxlan_vni(overlay: Ipv4Network) -> u32 {
    let high_byte = u32::from(overlay.ip()).to_be_bytes()[0] as u32;
    high_byte << 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash8_overlay_over_slash16_underlay_fits() {
        let overlay: Ipv4Network = "240.0.0.0/8".parse().unwrap();
        let underlay: Ipv4Network = "192.168.0.0/16".parse().unwrap();
        let host: Ipv4Addr = "192.168.5.9".parse().unwrap();
        let fan = compute_fan_address(overlay, underlay, host).unwrap();
        assert_eq!(fan, Ipv4Addr::new(240, 5, 9, 1));
    }

    /// §8 scenario 3: fan ipip on a host with 192.168.1.57/24 yields bridge
    /// address 240.1.57.1/24.
    #[test]
    fn slash8_overlay_over_slash24_underlay_matches_worked_example() {
        let overlay: Ipv4Network = "240.0.0.0/8".parse().unwrap();
        let underlay: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        let host: Ipv4Addr = "192.168.1.57".parse().unwrap();
        let fan = compute_fan_address(overlay, underlay, host).unwrap();
        assert_eq!(fan, Ipv4Addr::new(240, 1, 57, 1));
    }

    #[test]
    fn slash16_overlay_over_slash24_underlay_uses_both_overlay_octets() {
        let overlay: Ipv4Network = "240.5.0.0/16".parse().unwrap();
        let underlay: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        let host: Ipv4Addr = "192.168.1.57".parse().unwrap();
        let fan = compute_fan_address(overlay, underlay, host).unwrap();
        assert_eq!(fan, Ipv4Addr::new(240, 5, 57, 1));
    }

    #[test]
    fn oversized_overlay_underlay_combination_rejected() {
        let overlay: Ipv4Network = "240.0.0.0/16".parse().unwrap();
        let underlay: Ipv4Network = "192.168.0.0/8".parse().unwrap();
        let host: Ipv4Addr = "192.168.5.9".parse().unwrap();
        assert!(compute_fan_address(overlay, underlay, host).is_err());
    }

    #[test]
    fn ipip_mode_assigns_flat_slash24() {
        let overlay: Ipv4Network = "240.0.0.0/8".parse().unwrap();
        assert_eq!(bridge_overlay_prefix(overlay, FanTunnelType::Ipip), 24);
        assert_eq!(bridge_overlay_prefix(overlay, FanTunnelType::Vxlan), 8);
    }

    #[test]
    fn vxlan_vni_derived_from_high_byte() {
        let overlay: Ipv4Network = "240.0.0.0/8".parse().unwrap();
        assert_eq!(vxlan_vni(overlay), 240 << 16);
    }
}
