//! Host-only adapters and hypervisor CLI output parsing.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterId;
use crate::config::{ConfigError, HypervisorConfig};
use crate::pool::Resource;

/// Most nodes one adapter subnet can address: `.1` is the gateway, `.255`
/// the broadcast address.
pub const MAX_NODES: usize = 253;

const FIRST_HOST_OCTET: u32 = 2;
const SUBNET_STRIDE: u32 = 256;

/// A host-only network adapter handed out by the adapter pool.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct HostAdapter {
    /// Index of the adapter.
    pub adapter_id: u8,
    /// Interface name known to the hypervisor.
    pub name: String,
    /// Network address of the adapter's /24.
    pub subnet: Ipv4Addr,
    /// Netmask applied on host and guests.
    pub netmask: Ipv4Addr,
}

impl Resource for HostAdapter {
    fn resource_id(&self) -> String {
        self.name.clone()
    }
}

impl HostAdapter {
    /// Every adapter the configuration describes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the subnet base is unusable.
    pub fn universe(config: &HypervisorConfig) -> Result<Vec<Self>, ConfigError> {
        let base = u32::from(config.subnet_base_addr()?);
        Ok((0..config.adapter_count)
            .map(|adapter_id| Self {
                adapter_id,
                name: format!("{}{adapter_id}", config.adapter_prefix),
                subnet: Ipv4Addr::from(base + u32::from(adapter_id) * SUBNET_STRIDE),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            })
            .collect())
    }

    /// Host-side address of the adapter.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet) + 1)
    }

    /// Address of the `index`th node on this adapter, if the subnet has room.
    #[must_use]
    pub fn host_address(&self, index: usize) -> Option<Ipv4Addr> {
        if index >= MAX_NODES {
            return None;
        }
        let offset = u32::try_from(index).ok()?;
        Some(Ipv4Addr::from(
            u32::from(self.subnet) + FIRST_HOST_OCTET + offset,
        ))
    }
}

/// Name of the VM backing `node` of `cluster_id`.
#[must_use]
pub fn vm_name(node: &str, cluster_id: &ClusterId, suffix: &str) -> String {
    format!("{node}_{cluster_id}{suffix}")
}

/// Splits a VM name produced by [`vm_name`] into node name and cluster id.
///
/// Cluster ids never contain `_`, so the last underscore separates the two.
#[must_use]
pub fn parse_vm_name(vm: &str, suffix: &str) -> Option<(String, ClusterId)> {
    let stem = vm.strip_suffix(suffix)?;
    let (node, cluster) = stem.rsplit_once('_')?;
    if node.is_empty() || cluster.is_empty() {
        return None;
    }
    Some((node.to_owned(), ClusterId::from(cluster)))
}

/// Parses `list vms` output (`"name" {uuid}` per line) into VM names.
#[must_use]
pub fn parse_vm_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, _uuid) = line.trim().strip_prefix('"')?.rsplit_once("\" ")?;
            Some(name.to_owned())
        })
        .collect()
}

/// Extracts host-only adapter names from `showvminfo --machinereadable`.
#[must_use]
pub fn parse_hostonly_adapters(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let slot = key.strip_prefix("hostonlyadapter")?;
            if slot.is_empty() || !slot.bytes().all(|byte| byte.is_ascii_digit()) {
                return None;
            }
            let name = value.trim().trim_matches('"');
            (!name.is_empty()).then(|| name.to_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn universe_assigns_consecutive_subnets() {
        let config = HypervisorConfig {
            adapter_count: 3,
            ..HypervisorConfig::default()
        };

        let adapters = HostAdapter::universe(&config).expect("universe");

        let names: Vec<_> = adapters.iter().map(|adapter| adapter.name.as_str()).collect();
        assert_eq!(names, vec!["vboxnet0", "vboxnet1", "vboxnet2"]);
        assert_eq!(
            adapters.last().map(|adapter| adapter.subnet),
            Some(Ipv4Addr::new(172, 28, 2, 0))
        );
    }

    #[rstest]
    #[case(0, Some(Ipv4Addr::new(172, 28, 0, 2)))]
    #[case(252, Some(Ipv4Addr::new(172, 28, 0, 254)))]
    #[case(253, None)]
    fn host_addresses_follow_the_gateway(
        #[case] index: usize,
        #[case] expected: Option<Ipv4Addr>,
    ) {
        let adapter = HostAdapter {
            adapter_id: 0,
            name: String::from("vboxnet0"),
            subnet: Ipv4Addr::new(172, 28, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };

        assert_eq!(adapter.gateway(), Ipv4Addr::new(172, 28, 0, 1));
        assert_eq!(adapter.host_address(index), expected);
    }

    #[rstest]
    #[case("web_abc_covey", Some(("web", "abc")))]
    #[case("db_primary_abc_covey", Some(("db_primary", "abc")))]
    #[case("covey-template", None)]
    #[case("_abc_covey", None)]
    #[case("web_covey", None)]
    fn vm_names_split_into_node_and_cluster(
        #[case] vm: &str,
        #[case] expected: Option<(&str, &str)>,
    ) {
        let parsed = parse_vm_name(vm, "_covey");

        assert_eq!(
            parsed,
            expected.map(|(node, cluster)| (node.to_owned(), ClusterId::from(cluster)))
        );
    }

    #[rstest]
    fn vm_list_keeps_names_with_spaces() {
        let stdout = "\"covey-template\" {1111}\n\"my vm\" {2222}\ngarbage\n";

        assert_eq!(parse_vm_list(stdout), vec!["covey-template", "my vm"]);
    }

    #[rstest]
    fn hostonly_adapters_are_read_from_machine_readable_info() {
        let stdout = "name=\"web_abc_covey\"\nnic1=\"nat\"\nnic2=\"hostonly\"\nhostonlyadapter2=\"vboxnet3\"\nhostonlyadapterX=\"nope\"\n";

        assert_eq!(parse_hostonly_adapters(stdout), vec!["vboxnet3"]);
    }
}
