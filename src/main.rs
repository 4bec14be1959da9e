//! Binary entry point for the Covey CLI.

mod cli;

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::{self, Command};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use covey::{
    ActiveNode, AllocateError, AllocationOptions, AllocationOrchestrator, BackendError,
    BackendRegistry, BodyError, ClusterContext, ClusterRecord, ClusterSink, ConfigError,
    DestroyError, DestructionPolicy, HostAdapter, HypervisorBackend, HypervisorConfig,
    HypervisorError, NodeSpecs, ProcessCommandRunner, ReapSummary, RecordError, RegistryError,
};

use cli::{ActiveCommand, AllocateCommand, Cli, DestroyCommand, DestroyPolicyArg};

/// Environment variable holding the log filter directive.
const LOG_ENV_VAR: &str = "COVEY_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read node specs from {path}: {message}")]
    Nodes { path: Utf8PathBuf, message: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Allocate(#[from] AllocateError<BackendError>),
    #[error(transparent)]
    Destroy(#[from] DestroyError<BackendError>),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Raised by the allocation body when the command exits unsuccessfully.
#[derive(Debug, Error)]
enum BodyFailure {
    #[error("command exited with status {0}")]
    Exit(i32),
    #[error("command was terminated by a signal")]
    Signalled,
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Allocate(args) => allocate(args).await,
        Cli::Destroy(args) => destroy(args).await,
        Cli::Active(args) => active(args).await,
        Cli::Reap => reap().await,
    }
}

fn load_registry() -> Result<BackendRegistry, CliError> {
    let config = HypervisorConfig::load_without_cli_args()?;
    Ok(BackendRegistry::with_defaults(&config))
}

async fn allocate(args: AllocateCommand) -> Result<i32, CliError> {
    let specs = read_node_specs(&args.nodes)?;
    let backend = load_registry()?.create(&args.backend)?;
    let options = allocation_options(args.destroy, args.cluster_out.as_deref())?;
    let orchestrator = AllocationOrchestrator::new(backend);

    if args.command.is_empty() {
        let record = orchestrator.allocate(&specs, &options).await?;
        info!(cluster_id = %record.identity, nodes = record.nodes.len(), "cluster allocated");
        return Ok(0);
    }

    let command = args.command;
    let outcome = orchestrator
        .allocate_with(&specs, &options, |context| async move {
            run_body(&command, &context)
        })
        .await;
    exit_code(outcome)
}

fn allocation_options(
    policy: DestroyPolicyArg,
    cluster_out: Option<&str>,
) -> Result<AllocationOptions, CliError> {
    let options = AllocationOptions::default().with_destroy(destruction_policy(policy));
    match cluster_out {
        Some(target) => Ok(options.with_sink(target.parse::<ClusterSink>()?)),
        None => Ok(options),
    }
}

const fn destruction_policy(arg: DestroyPolicyArg) -> DestructionPolicy {
    match arg {
        DestroyPolicyArg::OnError => DestructionPolicy::OnError,
        DestroyPolicyArg::Always => DestructionPolicy::Always,
        DestroyPolicyArg::Never => DestructionPolicy::Never,
    }
}

fn read_node_specs(path: &Utf8Path) -> Result<NodeSpecs, CliError> {
    let failure = |message: String| CliError::Nodes {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| failure(String::from("path has no file name")))?;
    let contents = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read_to_string(file_name))
        .map_err(|err| failure(err.to_string()))?;
    serde_json::from_str(&contents).map_err(|err| failure(err.to_string()))
}

fn run_body(command: &[String], context: &ClusterContext) -> Result<(), BodyError> {
    let Some((program, rest)) = command.split_first() else {
        return Ok(());
    };
    let (key, value) = context.env();
    let status = Command::new(program)
        .args(rest)
        .env(key, value)
        .status()
        .map_err(|err| BodyFailure::Spawn {
            program: program.clone(),
            message: err.to_string(),
        })?;

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(Box::new(BodyFailure::Exit(code))),
        None => Err(Box::new(BodyFailure::Signalled)),
    }
}

/// Maps the allocation outcome to the process exit code, propagating the
/// command's own non-zero status.
fn exit_code(outcome: Result<(), AllocateError<BackendError>>) -> Result<i32, CliError> {
    match outcome {
        Ok(()) => Ok(0),
        Err(err) => {
            if let AllocateError::Body { cluster_id, source } = &err
                && let Some(BodyFailure::Exit(code)) = source.downcast_ref::<BodyFailure>()
            {
                warn!(%cluster_id, code, "command failed");
                return Ok(*code);
            }
            Err(err.into())
        }
    }
}

async fn destroy(args: DestroyCommand) -> Result<i32, CliError> {
    let record = ClusterRecord::locate(args.cluster.as_deref())?;
    let backend = load_registry()?.recreate(&record)?;
    AllocationOrchestrator::new(backend)
        .destroy(&record.identity)
        .await?;
    Ok(0)
}

async fn active(args: ActiveCommand) -> Result<i32, CliError> {
    let backend = load_registry()?.create(&args.backend)?;
    let nodes = AllocationOrchestrator::new(backend)
        .active_nodes(None)
        .await?;
    write_active(io::stdout().lock(), &nodes)?;
    Ok(0)
}

/// Writes one line per cluster: the id followed by its node identities.
fn write_active(mut target: impl Write, nodes: &[ActiveNode]) -> io::Result<()> {
    let mut clusters: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in nodes {
        clusters
            .entry(node.cluster_id.as_str())
            .or_default()
            .push(node.identity.as_str());
    }
    for (cluster_id, identities) in clusters {
        writeln!(target, "{cluster_id}\t{}", identities.join(" "))?;
    }
    target.flush()
}

async fn reap() -> Result<i32, CliError> {
    let config = HypervisorConfig::load_without_cli_args()?;
    let summary = HypervisorBackend::new(config, ProcessCommandRunner)?
        .reap()
        .await?;
    write_reap_summary(io::stdout(), &summary)?;
    Ok(i32::from(!summary.failures.is_empty()))
}

fn write_reap_summary(
    mut target: impl Write,
    summary: &ReapSummary<HostAdapter>,
) -> io::Result<()> {
    writeln!(
        target,
        "reclaimed {} adapter(s); {} node(s) still running",
        summary.reclaimed.len(),
        summary.active_nodes
    )?;
    for node in &summary.retained_nodes {
        writeln!(target, "kept stopped node {node}")?;
    }
    for failure in &summary.failures {
        writeln!(target, "failed to delete {failure}")?;
    }
    target.flush()
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
