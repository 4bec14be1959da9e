//! Reconciliation of pool bookkeeping against backend ground truth.
//!
//! A process that dies between acquiring a resource and recording its owner
//! leaves the resource neither free nor held. [`reconcile`] finds such
//! orphans by asking the backend which nodes are live and which resources each
//! one actually holds, then returns everything else to the pool. Resources
//! under a live pool lease are left alone, so a holder that has not yet
//! attached its resource to a node keeps it.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{ActiveNode, Backend, BackendFuture};
use crate::pool::{PoolError, Resource, ResourcePool};

/// Backend-specific introspection of pooled resources.
pub trait ResourceInventory {
    /// Resource type tracked in the pool.
    type Resource: Resource;
    /// Error raised while inspecting nodes.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Every resource the backend could ever hand out.
    fn all_resources(&self) -> Vec<Self::Resource>;

    /// Resources currently attached to `node`.
    fn resources_held_by<'a>(
        &'a self,
        node: &'a ActiveNode,
    ) -> BackendFuture<'a, Vec<Self::Resource>, Self::Error>;
}

/// Outcome of a reconciliation pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReapSummary<R> {
    /// Number of live nodes inspected.
    pub active_nodes: usize,
    /// Identities of stopped nodes left in place, whose resources stay held.
    pub retained_nodes: Vec<String>,
    /// Resources returned to the pool by this pass.
    pub reclaimed: Vec<R>,
    /// Node removals that failed during the pass, one line each.
    pub failures: Vec<String>,
}

/// Errors raised by [`reconcile`].
#[derive(Debug, Error)]
pub enum ReapError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the backend cannot list or inspect nodes.
    #[error("backend inspection failed: {0}")]
    Backend(#[source] E),
    /// Raised when the pool cannot be updated.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Returns every orphaned resource to `pool`.
///
/// Running it twice with no intervening change reclaims nothing the second
/// time.
///
/// # Errors
///
/// Returns [`ReapError::Backend`] when node listing or inspection fails and
/// [`ReapError::Pool`] when the pool cannot be read or written.
pub async fn reconcile<B, I>(
    backend: &B,
    inventory: &I,
    pool: &ResourcePool<I::Resource>,
) -> Result<ReapSummary<I::Resource>, ReapError<B::Error>>
where
    B: Backend + ?Sized,
    I: ResourceInventory<Error = B::Error> + ?Sized,
{
    reconcile_retaining(backend, inventory, pool, &[]).await
}

/// Like [`reconcile`], but also counts whatever the `retained` nodes hold.
///
/// `retained` lists nodes that are not live but still exist, such as stopped
/// VMs that could not be deleted. A retained node that cannot be inspected is
/// logged and skipped.
///
/// # Errors
///
/// Returns [`ReapError::Backend`] when listing or inspecting a live node fails
/// and [`ReapError::Pool`] when the pool cannot be read or written.
pub async fn reconcile_retaining<B, I>(
    backend: &B,
    inventory: &I,
    pool: &ResourcePool<I::Resource>,
    retained: &[ActiveNode],
) -> Result<ReapSummary<I::Resource>, ReapError<B::Error>>
where
    B: Backend + ?Sized,
    I: ResourceInventory<Error = B::Error> + ?Sized,
{
    let active = backend
        .find_active_nodes()
        .await
        .map_err(ReapError::Backend)?;

    let mut held = BTreeSet::new();
    for node in &active {
        let resources = inventory
            .resources_held_by(node)
            .await
            .map_err(ReapError::Backend)?;
        debug!(node = %node.identity, held = resources.len(), "inspected node");
        held.extend(resources.iter().map(Resource::resource_id));
    }
    for node in retained {
        match inventory.resources_held_by(node).await {
            Ok(resources) => {
                debug!(
                    node = %node.identity,
                    held = resources.len(),
                    "inspected retained node"
                );
                held.extend(resources.iter().map(Resource::resource_id));
            }
            Err(err) => {
                warn!(node = %node.identity, error = %err, "failed to inspect retained node");
            }
        }
    }

    let reclaimed = pool.reclaim(&inventory.all_resources(), &held)?;
    if !reclaimed.is_empty() {
        info!(
            backend = backend.name(),
            reclaimed = reclaimed.len(),
            "returned orphaned resources to the pool"
        );
    }

    Ok(ReapSummary {
        active_nodes: active.len(),
        retained_nodes: retained.iter().map(|node| node.identity.clone()).collect(),
        reclaimed,
        failures: Vec::new(),
    })
}
