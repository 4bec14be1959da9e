//! Cluster allocation lifecycle.
//!
//! An allocation attempt moves through start, allocation, assembly, an
//! optional body, and settlement. Settlement applies the
//! [`DestructionPolicy`]: a cluster that never assembled is always destroyed,
//! otherwise the policy decides. Destruction failures are logged when the
//! attempt already failed and returned when it had succeeded.

use std::error::Error as StdError;
use std::fmt;
use std::future::{self, Future};
use std::str::FromStr;
use std::time::Instant;

use chrono::Utc;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backend::{ActiveNode, Backend, NodeSpecs};
use crate::cluster::{
    AllocationDetails, CLUSTER_CONVENTION, ClusterContext, ClusterId, ClusterRecord, ClusterScope,
    ClusterSink, DriverDetails, RecordError,
};
use crate::command::{CommandRunner, ProcessCommandRunner};

/// Error type allocation bodies return.
pub type BodyError = Box<dyn StdError + Send + Sync>;

/// Whether to destroy a cluster once its allocation attempt settles.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DestructionPolicy {
    /// Destroy only when some step failed.
    #[default]
    OnError,
    /// Always destroy.
    Always,
    /// Never destroy an assembled cluster.
    Never,
}

impl DestructionPolicy {
    /// Decides whether an assembled cluster is destroyed given whether the
    /// attempt failed.
    #[must_use]
    pub const fn should_destroy(self, failed: bool) -> bool {
        match self {
            Self::OnError => failed,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl fmt::Display for DestructionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OnError => "on-error",
            Self::Always => "always",
            Self::Never => "never",
        })
    }
}

/// Raised when a destruction policy string is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown destruction policy {0:?}; expected on-error, always or never")]
pub struct UnknownPolicy(pub String);

impl FromStr for DestructionPolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "on-error" | "on_error" => Ok(Self::OnError),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// Per-attempt allocation settings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocationOptions {
    /// Destruction policy applied when the attempt settles.
    pub destroy: DestructionPolicy,
    /// Where to write the serialised record once assembled.
    pub sink: Option<ClusterSink>,
}

impl AllocationOptions {
    /// Sets the destruction policy.
    #[must_use]
    pub const fn with_destroy(mut self, policy: DestructionPolicy) -> Self {
        self.destroy = policy;
        self
    }

    /// Sets the record sink.
    #[must_use]
    pub fn with_sink(mut self, sink: ClusterSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Errors surfaced by [`AllocationOrchestrator::allocate`] and
/// [`AllocationOrchestrator::allocate_with`].
#[derive(Debug, Error)]
pub enum AllocateError<E>
where
    E: StdError + 'static,
{
    /// The backend refused the request before starting any node.
    #[error("allocation of cluster {cluster_id} was rejected: {source}")]
    Rejected {
        /// Cluster identifier of the attempt.
        cluster_id: ClusterId,
        /// Backend error.
        #[source]
        source: E,
    },
    /// A node failed to become ready; later nodes were not awaited.
    #[error("node {node} of cluster {cluster_id} failed to provision: {source}")]
    NodeProvisioning {
        /// Cluster identifier of the attempt.
        cluster_id: ClusterId,
        /// Node that failed.
        node: String,
        /// Backend error.
        #[source]
        source: E,
    },
    /// The assembled record could not be serialised or written.
    #[error("failed to publish record for cluster {cluster_id}: {source}")]
    Sink {
        /// Cluster identifier of the attempt.
        cluster_id: ClusterId,
        /// Record error.
        #[source]
        source: RecordError,
    },
    /// The caller's body failed.
    #[error("operation on cluster {cluster_id} failed: {source}")]
    Body {
        /// Cluster identifier of the attempt.
        cluster_id: ClusterId,
        /// Error returned by the body.
        #[source]
        source: BodyError,
    },
    /// Destruction failed after an otherwise successful attempt.
    #[error("cluster {cluster_id} may still be live; destruction failed: {source}")]
    Destruction {
        /// Cluster identifier of the attempt.
        cluster_id: ClusterId,
        /// Backend error.
        #[source]
        source: E,
    },
}

impl<E: StdError + 'static> AllocateError<E> {
    /// Cluster identifier of the failed attempt.
    #[must_use]
    pub const fn cluster_id(&self) -> &ClusterId {
        match self {
            Self::Rejected { cluster_id, .. }
            | Self::NodeProvisioning { cluster_id, .. }
            | Self::Sink { cluster_id, .. }
            | Self::Body { cluster_id, .. }
            | Self::Destruction { cluster_id, .. } => cluster_id,
        }
    }
}

/// Raised when a standalone destroy fails.
#[derive(Debug, Error)]
#[error("failed to destroy cluster {cluster_id}; its nodes may need manual cleanup: {source}")]
pub struct DestroyError<E>
where
    E: StdError + 'static,
{
    /// Cluster that could not be destroyed.
    pub cluster_id: ClusterId,
    /// Backend error.
    #[source]
    pub source: E,
}

enum Attempt<T, E: StdError + 'static> {
    Unassembled(AllocateError<E>),
    Assembled(Result<T, AllocateError<E>>),
}

/// Drives allocation attempts against a backend.
#[derive(Clone, Debug)]
pub struct AllocationOrchestrator<B> {
    backend: B,
    origin_host: Option<String>,
}

impl<B: Backend> AllocationOrchestrator<B> {
    /// Creates an orchestrator for `backend`.
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            origin_host: None,
        }
    }

    /// Overrides the host name written into records. By default the output
    /// of `hostname` is used.
    #[must_use]
    pub fn with_origin_host(mut self, host: impl Into<String>) -> Self {
        self.origin_host = Some(host.into());
        self
    }

    /// The wrapped backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Allocates a cluster and returns its record.
    ///
    /// # Errors
    ///
    /// Returns [`AllocateError`] when any step fails, after settling the
    /// cluster according to the destruction policy.
    pub async fn allocate(
        &self,
        specs: &NodeSpecs,
        options: &AllocationOptions,
    ) -> Result<ClusterRecord, AllocateError<B::Error>> {
        self.drive(specs, options, |_, context| {
            future::ready(Ok(context.into_record()))
        })
        .await
    }

    /// Allocates a cluster, runs `body` with it as the current cluster, and
    /// returns the body's value.
    ///
    /// The current-cluster slot is restored when the body finishes, whether
    /// it succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns [`AllocateError::Body`] when the body fails, and the other
    /// [`AllocateError`] variants as for [`AllocationOrchestrator::allocate`].
    pub async fn allocate_with<T, F, Fut>(
        &self,
        specs: &NodeSpecs,
        options: &AllocationOptions,
        body: F,
    ) -> Result<T, AllocateError<B::Error>>
    where
        F: FnOnce(ClusterContext) -> Fut,
        Fut: Future<Output = Result<T, BodyError>>,
    {
        self.drive(specs, options, |cluster_id, context| {
            run_body(cluster_id, context, body)
        })
        .await
    }

    /// Destroys a previously allocated cluster.
    ///
    /// # Errors
    ///
    /// Returns [`DestroyError`] carrying the cluster id when the backend
    /// fails.
    pub async fn destroy(&self, cluster_id: &ClusterId) -> Result<(), DestroyError<B::Error>> {
        self.backend
            .destroy_cluster(cluster_id)
            .instrument(info_span!("destruction", %cluster_id, backend = self.backend.name()))
            .await
            .map_err(|source| DestroyError {
                cluster_id: cluster_id.clone(),
                source,
            })?;
        info!(%cluster_id, "cluster destroyed");
        Ok(())
    }

    /// Live nodes, optionally restricted to one cluster.
    ///
    /// # Errors
    ///
    /// Returns the backend error when listing fails.
    pub async fn active_nodes(
        &self,
        cluster_id: Option<&ClusterId>,
    ) -> Result<Vec<ActiveNode>, B::Error> {
        let nodes = self.backend.find_active_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|node| cluster_id.is_none_or(|wanted| &node.cluster_id == wanted))
            .collect())
    }

    async fn drive<T, F, Fut>(
        &self,
        specs: &NodeSpecs,
        options: &AllocationOptions,
        finish: F,
    ) -> Result<T, AllocateError<B::Error>>
    where
        F: FnOnce(ClusterId, ClusterContext) -> Fut,
        Fut: Future<Output = Result<T, AllocateError<B::Error>>>,
    {
        let cluster_id = ClusterId::generate();
        let span = info_span!("cluster", %cluster_id, backend = self.backend.name());

        async {
            info!(nodes = specs.len(), policy = %options.destroy, "allocating cluster");
            let attempt = match self
                .assemble(&cluster_id, specs)
                .instrument(info_span!("allocation"))
                .await
            {
                Err(err) => Attempt::Unassembled(err),
                Ok(record) => match publish(&cluster_id, record, options.sink.as_ref()) {
                    Ok(context) => Attempt::Assembled(finish(cluster_id.clone(), context).await),
                    Err(err) => Attempt::Assembled(Err(err)),
                },
            };
            self.settle(&cluster_id, options.destroy, attempt).await
        }
        .instrument(span)
        .await
    }

    async fn assemble(
        &self,
        cluster_id: &ClusterId,
        specs: &NodeSpecs,
    ) -> Result<ClusterRecord, AllocateError<B::Error>> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut pending = self
            .backend
            .start_allocating_nodes(cluster_id, specs)
            .await
            .map_err(|source| AllocateError::Rejected {
                cluster_id: cluster_id.clone(),
                source,
            })?;
        let declared = |name: &String| specs.get_index_of(name).unwrap_or(usize::MAX);
        pending.sort_by(|left, _, right, _| declared(left).cmp(&declared(right)));

        let mut nodes = IndexMap::with_capacity(pending.len());
        for (node, allocation) in pending {
            debug!(%node, "waiting for node");
            let result =
                allocation
                    .resolve()
                    .await
                    .map_err(|source| AllocateError::NodeProvisioning {
                        cluster_id: cluster_id.clone(),
                        node: node.clone(),
                        source,
                    })?;
            info!(%node, address = %result.public_ip_address, "node ready");
            nodes.insert(node, result);
        }

        Ok(ClusterRecord {
            convention: CLUSTER_CONVENTION,
            identity: cluster_id.clone(),
            driver: DriverDetails {
                name: self.backend.name().to_owned(),
            },
            nodes,
            allocation: AllocationDetails {
                timestamp: started_at.to_rfc3339(),
                utc: started_at.timestamp(),
                host: self
                    .origin_host
                    .clone()
                    .unwrap_or_else(|| local_hostname(&ProcessCommandRunner)),
                duration: clock.elapsed().as_secs_f64(),
            },
        })
    }

    async fn settle<T>(
        &self,
        cluster_id: &ClusterId,
        policy: DestructionPolicy,
        attempt: Attempt<T, B::Error>,
    ) -> Result<T, AllocateError<B::Error>> {
        let (destroy, outcome) = match attempt {
            Attempt::Unassembled(err) => (true, Err(err)),
            Attempt::Assembled(outcome) => (policy.should_destroy(outcome.is_err()), outcome),
        };

        if !destroy {
            if outcome.is_err() {
                warn!(%policy, "leaving failed cluster live");
            }
            return outcome;
        }

        let destroyed = self
            .backend
            .destroy_cluster(cluster_id)
            .instrument(info_span!("destruction"))
            .await;

        match (outcome, destroyed) {
            (outcome, Ok(())) => {
                info!("cluster destroyed");
                outcome
            }
            (Err(err), Err(destroy_err)) => {
                error!(
                    error = %destroy_err,
                    "couldn't destroy cluster {cluster_id}; manual cleanup may be required"
                );
                Err(err)
            }
            (Ok(_), Err(source)) => Err(AllocateError::Destruction {
                cluster_id: cluster_id.clone(),
                source,
            }),
        }
    }
}

fn publish<E: StdError + 'static>(
    cluster_id: &ClusterId,
    record: ClusterRecord,
    sink: Option<&ClusterSink>,
) -> Result<ClusterContext, AllocateError<E>> {
    let to_sink_error = |source| AllocateError::Sink {
        cluster_id: cluster_id.clone(),
        source,
    };
    let context = ClusterContext::new(record).map_err(to_sink_error)?;
    if let Some(target) = sink {
        target.write(context.serialized()).map_err(to_sink_error)?;
        debug!(?target, "cluster record written");
    }
    Ok(context)
}

async fn run_body<T, E, F, Fut>(
    cluster_id: ClusterId,
    context: ClusterContext,
    body: F,
) -> Result<T, AllocateError<E>>
where
    E: StdError + 'static,
    F: FnOnce(ClusterContext) -> Fut,
    Fut: Future<Output = Result<T, BodyError>>,
{
    let scope = ClusterScope::enter(&context);
    let outcome = body(context).await;
    drop(scope);
    outcome.map_err(|source| AllocateError::Body { cluster_id, source })
}

fn local_hostname(runner: &impl CommandRunner) -> String {
    runner
        .run("hostname", &[])
        .ok()
        .filter(|output| output.is_success())
        .map(|output| output.stdout.trim().to_owned())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| String::from("unknown"))
}

#[cfg(test)]
mod tests;
