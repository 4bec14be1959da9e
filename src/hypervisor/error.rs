//! Errors raised by the hypervisor backend.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::BackendError;
use crate::command::CommandError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::ssh::SshError;

/// Errors raised by [`super::HypervisorBackend`].
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Raised when the backend configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when a node name or spec is unusable.
    #[error("invalid node {node}: {message}")]
    InvalidSpec {
        /// Node name.
        node: String,
        /// Validation failure.
        message: String,
    },
    /// Raised when a cluster needs more addresses than one adapter provides.
    #[error("{requested} nodes requested but an adapter subnet holds at most {max}")]
    TooManyNodes {
        /// Number of nodes requested.
        requested: usize,
        /// Maximum nodes per cluster.
        max: usize,
    },
    /// Raised when every host-only adapter is in use.
    #[error("no free host-only adapter in pool {pool_dir}")]
    NoFreeAdapter {
        /// Pool directory that was consulted.
        pool_dir: Utf8PathBuf,
    },
    /// Raised when a hypervisor or SSH command fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when key lookup or host key scanning fails.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the adapter pool cannot be used.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Raised when a VM does not accept SSH before the readiness timeout.
    #[error("{vm} did not accept ssh within {timeout_secs}s")]
    NotReady {
        /// VM that timed out.
        vm: String,
        /// Readiness timeout in seconds.
        timeout_secs: u64,
    },
    /// Raised when SSH fails with something other than a connection error.
    #[error("unexpected ssh failure on {vm} via its NAT port (status {status:?}): {stderr}")]
    UnexpectedSsh {
        /// VM being contacted.
        vm: String,
        /// Exit status of `ssh`.
        status: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when some VMs of a cluster could not be powered off.
    #[error("failed to power off VMs of cluster {cluster_id}: {}", failures.join("; "))]
    Destruction {
        /// Cluster being destroyed.
        cluster_id: String,
        /// One entry per VM that failed.
        failures: Vec<String>,
    },
}

impl From<HypervisorError> for BackendError {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::InvalidSpec { .. }
            | HypervisorError::TooManyNodes { .. }
            | HypervisorError::NoFreeAdapter { .. } => Self::Rejected {
                message: err.to_string(),
            },
            HypervisorError::NotReady { ref vm, .. } | HypervisorError::UnexpectedSsh { ref vm, .. } => {
                Self::Provisioning {
                    node: vm.clone(),
                    message: err.to_string(),
                }
            }
            HypervisorError::Destruction { ref cluster_id, .. } => Self::Destruction {
                cluster_id: cluster_id.clone(),
                message: err.to_string(),
            },
            HypervisorError::Config(_)
            | HypervisorError::Command(_)
            | HypervisorError::Ssh(_)
            | HypervisorError::Pool(_) => Self::Provider {
                message: err.to_string(),
            },
        }
    }
}
