// SPDX-License-Identifier: Apache-2.0

//! Top-level state machine and update diff/apply/revert (§4.8).

use crate::collaborators::Collaborators;
use crate::config;
use crate::error::{ErrorKind, NetbridgeError, Result};
use crate::reconciler::{self, SetupOutcome};
use crate::types::{ConfigMap, Network, NetworkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    User,
    Cluster,
}

/// Validates the new interface name and fills/validates its config before
/// the DB record is written (§4.8 `create`).
pub fn create(
    host: &dyn config::HostProbe,
    netlink: &dyn crate::collaborators::NetlinkApi,
    network: &mut Network,
) -> Result<()> {
    if netlink.link_exists(&network.name)? {
        return Err(NetbridgeError::conflict(format!(
            "interface '{}' already in use",
            network.name
        )));
    }
    config::fill_config(&mut network.config, &network.name, host)?;
    network.status = NetworkStatus::Pending;
    Ok(())
}

/// Brings a member's network up: reconcile host state, mark it `Created`
/// on success (§4.8 `start`).
pub fn start(
    collabs: &Collaborators<'_>,
    var_dir: &str,
    node_id: u64,
    server_cert_fingerprint: &str,
    network: &mut Network,
    member: &str,
) -> Result<SetupOutcome> {
    if network.status == NetworkStatus::Pending && network.local_status.is_empty() {
        return Err(NetbridgeError::new(
            ErrorKind::Precondition,
            "cannot start a network with no recorded members",
        ));
    }

    network
        .local_status
        .insert(member.to_string(), NetworkStatus::Unknown);

    let result = reconciler::setup(
        collabs,
        &network.name,
        var_dir,
        node_id,
        network.id,
        server_cert_fingerprint,
        &network.config,
        None,
    );

    match result {
        Ok(outcome) => {
            network
                .local_status
                .insert(member.to_string(), NetworkStatus::Created);
            if network.is_globally_created() {
                network.status = NetworkStatus::Created;
            }
            Ok(outcome)
        }
        Err(e) => {
            network
                .local_status
                .insert(member.to_string(), NetworkStatus::Errored);
            network.status = NetworkStatus::Errored;
            Err(e)
        }
    }
}

/// Tears a member's network down (§4.8 `stop`).
pub fn stop(collabs: &Collaborators<'_>, network: &mut Network, member: &str) -> Result<()> {
    reconciler::stop(collabs, &network.name)?;
    network
        .local_status
        .insert(member.to_string(), NetworkStatus::Pending);
    network.status = NetworkStatus::Pending;
    Ok(())
}

/// Validates a rename, rejecting a collision with an existing interface
/// (§4.8 `rename`).
pub fn validate_rename(netlink: &dyn crate::collaborators::NetlinkApi, new_name: &str) -> Result<()> {
    if netlink.link_exists(new_name)? {
        return Err(NetbridgeError::conflict(format!(
            "interface '{new_name}' already in use"
        )));
    }
    Ok(())
}

/// The set of config keys whose change forces specific extra steps on
/// `update`, per §4.8.
pub struct UpdatePlan {
    pub db_only: bool,
    pub must_stop_bridge: bool,
    pub detach_external: Vec<String>,
}

/// Diffs `old` against `new` and decides what `update` must additionally
/// do besides the DB write and `setup(old_config)` reconciliation
/// (§4.8 `update`).
pub fn plan_update(old: &ConfigMap, new: &ConfigMap, materialised: bool) -> UpdatePlan {
    if !materialised {
        return UpdatePlan {
            db_only: true,
            must_stop_bridge: false,
            detach_external: Vec::new(),
        };
    }

    let must_stop_bridge = old.get("bridge.driver") != new.get("bridge.driver");

    let old_external: std::collections::HashSet<&str> = old
        .get("bridge.external_interfaces")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let new_external: std::collections::HashSet<&str> = new
        .get("bridge.external_interfaces")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let detach_external = old_external
        .difference(&new_external)
        .map(|s| s.to_string())
        .collect();

    UpdatePlan {
        db_only: false,
        must_stop_bridge,
        detach_external,
    }
}

/// Applies an update, rolling the config back to `old` and re-reconciling
/// if any step fails (§4.8 `update` failure path).
pub fn apply_update(
    collabs: &Collaborators<'_>,
    var_dir: &str,
    node_id: u64,
    server_cert_fingerprint: &str,
    network: &mut Network,
    old_config: ConfigMap,
) -> Result<SetupOutcome> {
    let result = reconciler::setup(
        collabs,
        &network.name,
        var_dir,
        node_id,
        network.id,
        server_cert_fingerprint,
        &network.config,
        Some(&old_config),
    );

    if let Err(e) = result {
        let new_config = std::mem::replace(&mut network.config, old_config.clone());
        let revert = reconciler::setup(
            collabs,
            &network.name,
            var_dir,
            node_id,
            network.id,
            server_cert_fingerprint,
            &network.config,
            Some(&new_config),
        );
        return match revert {
            Ok(_) => Err(e),
            Err(revert_err) => Err(e.context(format!("revert also failed: {revert_err}"))),
        };
    }

    result
}

/// Clears BGP advertisement without touching the bridge or resolver
/// (§4.8 `evacuate`).
pub fn evacuate(collabs: &Collaborators<'_>, network_name: &str) -> Result<()> {
    collabs.bgp.withdraw_network(network_name)
}

/// Re-applies BGP advertisement for every configured prefix (§4.8
/// `restore`).
pub fn restore(
    collabs: &Collaborators<'_>,
    network_name: &str,
    prefixes: &[ipnetwork::IpNetwork],
) -> Result<()> {
    collabs.bgp.advertise_network(network_name, prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmaterialised_update_is_db_only() {
        let old = ConfigMap::new();
        let new = ConfigMap::new();
        let plan = plan_update(&old, &new, false);
        assert!(plan.db_only);
    }

    #[test]
    fn driver_change_forces_bridge_stop() {
        let mut old = ConfigMap::new();
        old.insert("bridge.driver".into(), "native".into());
        let mut new = ConfigMap::new();
        new.insert("bridge.driver".into(), "openvswitch".into());
        let plan = plan_update(&old, &new, true);
        assert!(plan.must_stop_bridge);
    }

    #[test]
    fn removed_external_interface_is_detached() {
        let mut old = ConfigMap::new();
        old.insert("bridge.external_interfaces".into(), "eth0,eth1".into());
        let mut new = ConfigMap::new();
        new.insert("bridge.external_interfaces".into(), "eth0".into());
        let plan = plan_update(&old, &new, true);
        assert_eq!(plan.detach_external, vec!["eth1".to_string()]);
    }
}
