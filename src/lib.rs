//! Core library for the Covey cluster allocator.
//!
//! The crate provisions short-lived clusters of named nodes through a
//! pluggable backend abstraction, records the result as a durable
//! [`ClusterRecord`], and tears the cluster down according to a
//! [`DestructionPolicy`]. Scarce host-local resources such as host-only
//! network adapters are arbitrated across concurrently running processes by a
//! file-locked [`ResourcePool`], kept honest by [`reap::reconcile`].

pub mod backend;
pub mod cluster;
pub mod command;
pub mod config;
pub mod hypervisor;
pub mod orchestrator;
pub mod pool;
pub mod reap;
pub mod registry;
pub mod ssh;
pub mod test_support;

pub use backend::{
    ActiveNode, Backend, BackendError, BackendFuture, NodeResult, NodeSpec, NodeSpecBuilder,
    NodeSpecs, PendingAllocation, PendingAllocations, SshDetails,
};
pub use cluster::{
    CLUSTER_ENV_VAR, ClusterContext, ClusterId, ClusterRecord, ClusterScope, ClusterSink,
    RecordError, current_cluster,
};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, HypervisorConfig};
pub use hypervisor::{HostAdapter, HypervisorBackend, HypervisorError};
pub use orchestrator::{
    AllocateError, AllocationOptions, AllocationOrchestrator, BodyError, DestroyError,
    DestructionPolicy, UnknownPolicy,
};
pub use pool::{DEFAULT_LEASE_TTL, Lease, PoolError, Resource, ResourcePool};
pub use reap::{ReapError, ReapSummary, ResourceInventory, reconcile, reconcile_retaining};
pub use registry::{BackendRegistry, DynBackend, RegistryError};
pub use ssh::SshError;
