//! Command-line interface definitions for the `covey` binary.
//!
//! The parser lives in its own module so the build script can render the
//! manual page from the same definitions.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};

/// Top-level CLI for the `covey` binary.
#[derive(Debug, Parser)]
#[command(
    name = "covey",
    about = "Allocate short-lived clusters of VMs and tear them down again",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Allocate a cluster, optionally run a command against it, then apply
    /// the destruction policy.
    #[command(name = "allocate", about = "Allocate a cluster and run a command against it")]
    Allocate(AllocateCommand),
    /// Destroy a previously allocated cluster.
    #[command(name = "destroy", about = "Destroy a cluster described by a record")]
    Destroy(DestroyCommand),
    /// List live nodes grouped by cluster.
    #[command(name = "active", about = "List live nodes of a backend")]
    Active(ActiveCommand),
    /// Delete stopped VMs and return orphaned adapters to the pool.
    #[command(name = "reap", about = "Reclaim resources leaked by crashed runs")]
    Reap,
}

/// When to tear the cluster down after `allocate`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum DestroyPolicyArg {
    /// Destroy only when allocation or the command fails.
    #[default]
    OnError,
    /// Always destroy.
    Always,
    /// Never destroy.
    Never,
}

/// Arguments for `covey allocate`.
#[derive(Debug, Parser)]
pub(crate) struct AllocateCommand {
    /// JSON file mapping node names to node specs, in allocation order.
    #[arg(long, value_name = "FILE")]
    pub(crate) nodes: Utf8PathBuf,
    /// Backend that provisions the nodes.
    #[arg(long, value_name = "NAME", default_value = "hypervisor")]
    pub(crate) backend: String,
    /// Destruction policy applied once the command finishes.
    #[arg(long, value_enum, value_name = "POLICY", default_value_t)]
    pub(crate) destroy: DestroyPolicyArg,
    /// Where to write the cluster record (`-` for stdout).
    #[arg(long, value_name = "PATH")]
    pub(crate) cluster_out: Option<String>,
    /// Command to run with `COVEY_CLUSTER` set (use -- to separate flags).
    #[arg(trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `covey destroy`.
#[derive(Debug, Parser)]
pub(crate) struct DestroyCommand {
    /// Cluster record to destroy. Defaults to the current cluster or
    /// `covey.json`.
    #[arg(long, value_name = "PATH")]
    pub(crate) cluster: Option<Utf8PathBuf>,
}

/// Arguments for `covey active`.
#[derive(Debug, Parser)]
pub(crate) struct ActiveCommand {
    /// Backend to query.
    #[arg(long, value_name = "NAME", default_value = "hypervisor")]
    pub(crate) backend: String,
}
