//! Hypervisor backend driving a `VBoxManage`-style management CLI.
//!
//! Every node is a linked clone of a template VM with two NICs: a NAT NIC
//! with an SSH port forward used to bootstrap the guest, and a host-only NIC
//! on an adapter checked out of a cross-process [`ResourcePool`]. VM names
//! encode the node and cluster (`<node>_<cluster><suffix>`), which is all the
//! state the backend needs to rediscover live clusters.

mod adapter;
mod error;
mod lifecycle;

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::backend::{ActiveNode, Backend, BackendFuture, NodeSpecs, PendingAllocations};
use crate::cluster::ClusterId;
use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::HypervisorConfig;
use crate::pool::ResourcePool;
use crate::reap::ResourceInventory;
use crate::ssh::expand_tilde;

pub use adapter::{
    HostAdapter, MAX_NODES, parse_hostonly_adapters, parse_vm_list, parse_vm_name, vm_name,
};
pub use error::HypervisorError;

/// Name under which the backend registers and appears in records.
pub const HYPERVISOR_BACKEND_NAME: &str = "hypervisor";

/// Key assumed for the template image when none is configured.
pub const DEFAULT_TEMPLATE_KEY: &str = "~/.ssh/id_covey_template";

/// Backend provisioning nodes as local hypervisor VMs.
#[derive(Debug)]
pub struct HypervisorBackend<R = ProcessCommandRunner> {
    config: HypervisorConfig,
    runner: R,
    pool: ResourcePool<HostAdapter>,
    adapters: Vec<HostAdapter>,
    template_key: Utf8PathBuf,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl HypervisorBackend<ProcessCommandRunner> {
    /// Builds a backend from layered configuration, running real commands.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when configuration loading, validation, or
    /// opening the adapter pool fails.
    pub fn from_sources() -> Result<Self, HypervisorError> {
        Self::new(
            HypervisorConfig::load_without_cli_args()?,
            ProcessCommandRunner,
        )
    }
}

impl<R: CommandRunner> HypervisorBackend<R> {
    /// Validates `config` and opens the adapter pool.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::Config`] for invalid settings and
    /// [`HypervisorError::Pool`] when the pool directory is unusable.
    pub fn new(config: HypervisorConfig, runner: R) -> Result<Self, HypervisorError> {
        config.validate()?;
        let adapters = HostAdapter::universe(&config)?;
        let pool = ResourcePool::open(expand_tilde(&config.pool_dir))?;
        let template_key = Utf8PathBuf::from(expand_tilde(
            config
                .template_key_path
                .as_deref()
                .unwrap_or(DEFAULT_TEMPLATE_KEY),
        ));
        let ready_timeout = Duration::from_secs(config.ready_timeout_secs);
        let poll_interval = Duration::from_secs(config.poll_interval_secs);

        Ok(Self {
            config,
            runner,
            pool,
            adapters,
            template_key,
            ready_timeout,
            poll_interval,
        })
    }

    /// Overrides the delay between readiness probes.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides how long a node may take to accept SSH.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// The adapter pool shared with other processes.
    #[must_use]
    pub const fn pool(&self) -> &ResourcePool<HostAdapter> {
        &self.pool
    }

    /// Every adapter this backend may hand out.
    #[must_use]
    pub fn adapters(&self) -> &[HostAdapter] {
        &self.adapters
    }
}

impl<R> Backend for HypervisorBackend<R>
where
    R: CommandRunner + Send + Sync,
{
    type Error = HypervisorError;

    fn name(&self) -> &str {
        HYPERVISOR_BACKEND_NAME
    }

    fn find_active_nodes(&self) -> BackendFuture<'_, Vec<ActiveNode>, Self::Error> {
        Box::pin(async move { self.active_vms() })
    }

    fn start_allocating_nodes<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> BackendFuture<'a, PendingAllocations<'a, Self::Error>, Self::Error> {
        Box::pin(self.start_cluster(cluster_id, specs))
    }

    fn destroy_cluster<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.destroy(cluster_id))
    }
}

impl<R> ResourceInventory for HypervisorBackend<R>
where
    R: CommandRunner + Send + Sync,
{
    type Resource = HostAdapter;
    type Error = HypervisorError;

    fn all_resources(&self) -> Vec<HostAdapter> {
        self.adapters.clone()
    }

    fn resources_held_by<'a>(
        &'a self,
        node: &'a ActiveNode,
    ) -> BackendFuture<'a, Vec<HostAdapter>, Self::Error> {
        Box::pin(async move {
            let info = self.vbox(&["showvminfo", &node.identity, "--machinereadable"])?;
            let attached = parse_hostonly_adapters(&info);
            Ok(self
                .adapters
                .iter()
                .filter(|adapter| attached.contains(&adapter.name))
                .cloned()
                .collect())
        })
    }
}
