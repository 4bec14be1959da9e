//! Backend lookup by name.
//!
//! Cluster records persist only the backend name, so a later process needs a
//! way to rebuild the backend that allocated a cluster. The registry maps
//! names to constructors producing type-erased backends.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::backend::{
    ActiveNode, Backend, BackendError, BackendFuture, NodeSpecs, PendingAllocations,
};
use crate::cluster::{ClusterId, ClusterRecord};
use crate::command::ProcessCommandRunner;
use crate::config::HypervisorConfig;
use crate::hypervisor::{HYPERVISOR_BACKEND_NAME, HypervisorBackend};

/// A backend with its error type erased to [`BackendError`].
pub type DynBackend = Box<dyn Backend<Error = BackendError> + Send + Sync>;

type Constructor = Box<dyn Fn() -> Result<DynBackend, BackendError> + Send + Sync>;

/// Errors raised by [`BackendRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raised when no constructor is registered under a name.
    #[error("unknown backend {name}; known backends: {known:?}")]
    BackendNotFound {
        /// Requested backend name.
        name: String,
        /// Registered names.
        known: Vec<String>,
    },
    /// Raised when a registered constructor fails.
    #[error("failed to construct backend {name}: {source}")]
    Construction {
        /// Backend name.
        name: String,
        /// Constructor error.
        #[source]
        source: BackendError,
    },
}

/// Name to constructor mapping.
#[derive(Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in backends, configured from
    /// `config`.
    #[must_use]
    pub fn with_defaults(config: &HypervisorConfig) -> Self {
        let mut registry = Self::new();
        let hypervisor_config = config.clone();
        registry.register_backend(HYPERVISOR_BACKEND_NAME, move || {
            HypervisorBackend::new(hypervisor_config.clone(), ProcessCommandRunner)
                .map_err(BackendError::from)
        });
        registry
    }

    /// Registers a constructor that already yields erased backends. A later
    /// registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Result<DynBackend, BackendError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Registers a constructor for a concrete backend, erasing its error type.
    pub fn register_backend<B, F>(&mut self, name: impl Into<String>, constructor: F)
    where
        B: Backend + Send + Sync + 'static,
        B::Error: Into<BackendError>,
        F: Fn() -> Result<B, BackendError> + Send + Sync + 'static,
    {
        self.register(name, move || {
            let backend = constructor()?;
            Ok(Box::new(ErasedBackend(backend)) as DynBackend)
        });
    }

    /// Builds the backend registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BackendNotFound`] for unknown names and
    /// [`RegistryError::Construction`] when the constructor fails.
    pub fn create(&self, name: &str) -> Result<DynBackend, RegistryError> {
        let constructor =
            self.constructors
                .get(name)
                .ok_or_else(|| RegistryError::BackendNotFound {
                    name: name.to_owned(),
                    known: self.names(),
                })?;
        constructor().map_err(|source| RegistryError::Construction {
            name: name.to_owned(),
            source,
        })
    }

    /// Builds the backend that allocated `record`.
    ///
    /// # Errors
    ///
    /// Same as [`BackendRegistry::create`].
    pub fn recreate(&self, record: &ClusterRecord) -> Result<DynBackend, RegistryError> {
        self.create(&record.driver.name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }
}

struct ErasedBackend<B>(B);

impl<B> Backend for ErasedBackend<B>
where
    B: Backend + Send + Sync,
    B::Error: Into<BackendError>,
{
    type Error = BackendError;

    fn name(&self) -> &str {
        self.0.name()
    }

    fn find_active_nodes(&self) -> BackendFuture<'_, Vec<ActiveNode>, Self::Error> {
        Box::pin(async move { self.0.find_active_nodes().await.map_err(Into::into) })
    }

    fn start_allocating_nodes<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> BackendFuture<'a, PendingAllocations<'a, Self::Error>, Self::Error> {
        Box::pin(async move {
            let pending = self
                .0
                .start_allocating_nodes(cluster_id, specs)
                .await
                .map_err(Into::into)?;
            Ok(pending
                .into_iter()
                .map(|(name, allocation)| (name, allocation.map_err(Into::into)))
                .collect())
        })
    }

    fn destroy_cluster<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.0.destroy_cluster(cluster_id).await.map_err(Into::into) })
    }
}
