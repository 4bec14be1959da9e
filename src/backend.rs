//! Backend abstraction for provisioning disposable clusters of nodes.
//!
//! A backend allocates in two phases. [`Backend::start_allocating_nodes`]
//! issues the non-blocking start step for every node and hands back one
//! [`PendingAllocation`] per node; resolving a pending allocation performs the
//! slow wait for readiness. Splitting the phases lets every node boot in
//! parallel even though readiness is awaited one node at a time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cluster::ClusterId;

/// Named fields of [`NodeSpec`]; extensions may not reuse them.
pub const NODE_SPEC_FIELDS: [&str; 4] =
    ["ssh_key_name", "bootstrap_command", "username", "root_password"];

/// Named fields of [`NodeResult`]; extensions may not reuse them.
pub const NODE_RESULT_FIELDS: [&str; 3] = ["identity", "public_ip_address", "ssh"];

/// Ordered mapping of node name to specification. Insertion order is the
/// caller's declared node order.
pub type NodeSpecs = IndexMap<String, NodeSpec>;

/// Caller supplied description of a single node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSpec {
    /// Name of the SSH key pair used to reach the node. Absolute paths and
    /// `./`-relative paths are used verbatim; other names are looked up in
    /// `~/.ssh`.
    pub ssh_key_name: String,
    /// Command run on the node once it is reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_command: Option<String>,
    /// Login user; backends fall back to their own default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Root password to set on the node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
    /// Backend-interpreted properties, flattened into the node's JSON. Keys
    /// must not repeat a name in [`NODE_SPEC_FIELDS`].
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl NodeSpec {
    /// Starts a builder for a [`NodeSpec`].
    #[must_use]
    pub fn builder(ssh_key_name: impl Into<String>) -> NodeSpecBuilder {
        NodeSpecBuilder::new(ssh_key_name)
    }

    /// Validates the spec, naming the first offending field.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the key name is blank or an
    /// optional string field is present but blank, and
    /// [`BackendError::ReservedExtension`] when an extension key shadows a
    /// named field.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.ssh_key_name.trim().is_empty() {
            return Err(BackendError::Validation(String::from("ssh_key_name")));
        }
        for (field, value) in [
            ("bootstrap_command", &self.bootstrap_command),
            ("username", &self.username),
            ("root_password", &self.root_password),
        ] {
            if value.as_deref().is_some_and(|text| text.trim().is_empty()) {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        reject_reserved_keys(&self.extensions, &NODE_SPEC_FIELDS)
    }

    /// Returns a backend-specific string property.
    #[must_use]
    pub fn extension_str(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).and_then(Value::as_str)
    }
}

/// Builder for [`NodeSpec`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeSpecBuilder {
    ssh_key_name: String,
    bootstrap_command: Option<String>,
    username: Option<String>,
    root_password: Option<String>,
    extensions: Map<String, Value>,
}

impl NodeSpecBuilder {
    /// Creates a builder for a node reachable with the named key.
    #[must_use]
    pub fn new(ssh_key_name: impl Into<String>) -> Self {
        Self {
            ssh_key_name: ssh_key_name.into(),
            ..Self::default()
        }
    }

    /// Sets the bootstrap command.
    #[must_use]
    pub fn bootstrap_command(mut self, value: impl Into<String>) -> Self {
        self.bootstrap_command = Some(value.into());
        self
    }

    /// Sets the login user.
    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = Some(value.into());
        self
    }

    /// Sets the root password.
    #[must_use]
    pub fn root_password(mut self, value: impl Into<String>) -> Self {
        self.root_password = Some(value.into());
        self
    }

    /// Adds a backend-specific property.
    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the [`NodeSpec`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when a field is blank and
    /// [`BackendError::ReservedExtension`] when an extension shadows a field.
    pub fn build(self) -> Result<NodeSpec, BackendError> {
        let spec = NodeSpec {
            ssh_key_name: self.ssh_key_name.trim().to_owned(),
            bootstrap_command: self.bootstrap_command.map(|value| value.trim().to_owned()),
            username: self.username.map(|value| value.trim().to_owned()),
            root_password: self.root_password,
            extensions: self.extensions,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// SSH connection material for an allocated node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SshDetails {
    /// Login user.
    pub user: String,
    /// Key name as given in the node spec.
    pub private_key_name: String,
    /// Host key line as produced by `ssh-keyscan`.
    pub public_host_key: String,
}

/// Backend produced description of an allocated node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeResult {
    /// Backend specific handle for the node.
    pub identity: String,
    /// Address reachable from the allocating host.
    pub public_ip_address: String,
    /// SSH connection material.
    pub ssh: SshDetails,
    /// Backend-specific details such as volume or adapter ids. Keys must not
    /// repeat a name in [`NODE_RESULT_FIELDS`].
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl NodeResult {
    /// Checks that no extension key shadows a named field, which would make
    /// the node's JSON ambiguous.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ReservedExtension`] naming the first clash.
    pub fn validate(&self) -> Result<(), BackendError> {
        reject_reserved_keys(&self.extensions, &NODE_RESULT_FIELDS)
    }
}

fn reject_reserved_keys(
    extensions: &Map<String, Value>,
    fields: &[&str],
) -> Result<(), BackendError> {
    match fields.iter().find(|field| extensions.contains_key(**field)) {
        Some(field) => Err(BackendError::ReservedExtension((*field).to_owned())),
        None => Ok(()),
    }
}

/// A live node as reported by a backend.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ActiveNode {
    /// Cluster the node was allocated for.
    pub cluster_id: ClusterId,
    /// Backend specific handle for the node.
    pub identity: String,
}

/// Errors raised by backends that do not define their own error type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when an extension key repeats a named field.
    #[error("extension key {0} clashes with a named field")]
    ReservedExtension(String),
    /// Raised when the backend refuses an allocation before starting it.
    #[error("allocation rejected: {message}")]
    Rejected {
        /// Reason for the rejection.
        message: String,
    },
    /// Raised when a node fails to become ready.
    #[error("node {node} failed to provision: {message}")]
    Provisioning {
        /// Node that failed.
        node: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when a cluster cannot be torn down.
    #[error("failed to destroy cluster {cluster_id}: {message}")]
    Destruction {
        /// Cluster that could not be destroyed.
        cluster_id: String,
        /// Description of the failure.
        message: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider.
        message: String,
    },
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Deferred completion of a node allocation.
///
/// Produced by the start phase and consumed exactly once by
/// [`PendingAllocation::resolve`], which waits for the node to become ready.
pub struct PendingAllocation<'a, E> {
    future: BackendFuture<'a, NodeResult, E>,
}

/// Pending allocations keyed by node name.
pub type PendingAllocations<'a, E> = IndexMap<String, PendingAllocation<'a, E>>;

impl<'a, E: Send + 'a> PendingAllocation<'a, E> {
    /// Wraps the readiness work for a node.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<NodeResult, E>> + Send + 'a,
    {
        Self {
            future: Box::pin(future),
        }
    }

    /// A pending allocation that is already complete.
    #[must_use]
    pub fn ready(result: NodeResult) -> Self {
        Self::new(std::future::ready(Ok(result)))
    }

    /// Waits for the node and returns its description.
    ///
    /// # Errors
    ///
    /// Returns the backend error raised while waiting for readiness.
    pub async fn resolve(self) -> Result<NodeResult, E> {
        self.future.await
    }

    /// Converts the error type of the eventual result.
    #[must_use]
    pub fn map_err<E2, F>(self, convert: F) -> PendingAllocation<'a, E2>
    where
        E2: Send + 'a,
        F: FnOnce(E) -> E2 + Send + 'a,
    {
        PendingAllocation::new(async move { self.future.await.map_err(convert) })
    }
}

impl<E> fmt::Debug for PendingAllocation<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAllocation").finish_non_exhaustive()
    }
}

/// Capability set every provisioning backend implements.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable backend identifier, persisted into every cluster record so a
    /// later process can recreate the backend.
    fn name(&self) -> &str;

    /// Lists every node the backend considers live, whichever process
    /// created it.
    fn find_active_nodes(&self) -> BackendFuture<'_, Vec<ActiveNode>, Self::Error>;

    /// Starts provisioning every node in `specs` without waiting for
    /// readiness.
    ///
    /// Implementations reject invalid input before running any node's start
    /// step.
    fn start_allocating_nodes<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> BackendFuture<'a, PendingAllocations<'a, Self::Error>, Self::Error>;

    /// Terminates every node of `cluster_id` and releases what it held.
    /// Safe to call on a partially allocated cluster.
    fn destroy_cluster<'a>(&'a self, cluster_id: &'a ClusterId)
    -> BackendFuture<'a, (), Self::Error>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    type Error = B::Error;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn find_active_nodes(&self) -> BackendFuture<'_, Vec<ActiveNode>, Self::Error> {
        (**self).find_active_nodes()
    }

    fn start_allocating_nodes<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> BackendFuture<'a, PendingAllocations<'a, Self::Error>, Self::Error> {
        (**self).start_allocating_nodes(cluster_id, specs)
    }

    fn destroy_cluster<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
    ) -> BackendFuture<'a, (), Self::Error> {
        (**self).destroy_cluster(cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn builder_trims_and_validates() {
        let spec = NodeSpec::builder("  id_covey ")
            .username(" ubuntu ")
            .extension("template", "jammy")
            .build()
            .expect("spec should build");

        assert_eq!(spec.ssh_key_name, "id_covey");
        assert_eq!(spec.username.as_deref(), Some("ubuntu"));
        assert_eq!(spec.extension_str("template"), Some("jammy"));
    }

    #[rstest]
    #[case(NodeSpec::builder("   "), "ssh_key_name")]
    #[case(NodeSpec::builder("id").username(" "), "username")]
    #[case(NodeSpec::builder("id").bootstrap_command(""), "bootstrap_command")]
    fn builder_rejects_blank_fields(#[case] builder: NodeSpecBuilder, #[case] field: &str) {
        let err = builder.build().expect_err("blank field should fail");
        assert_eq!(err, BackendError::Validation(field.to_owned()));
    }

    #[rstest]
    #[case("username")]
    #[case("ssh_key_name")]
    fn spec_extensions_may_not_shadow_fields(#[case] key: &str) {
        let err = NodeSpec::builder("id")
            .extension(key, "shadow")
            .build()
            .expect_err("reserved key should fail");

        assert_eq!(err, BackendError::ReservedExtension(key.to_owned()));
    }

    #[rstest]
    fn result_extensions_may_not_shadow_fields() {
        let mut extensions = Map::new();
        extensions.insert(String::from("ssh"), Value::from("shadow"));
        let node = NodeResult {
            identity: String::from("vm-1"),
            public_ip_address: String::from("10.0.0.2"),
            ssh: SshDetails {
                user: String::from("root"),
                private_key_name: String::from("id"),
                public_host_key: String::from("10.0.0.2 ssh-ed25519 AAAA"),
            },
            extensions,
        };

        assert_eq!(
            node.validate(),
            Err(BackendError::ReservedExtension(String::from("ssh")))
        );
    }

    #[rstest]
    fn spec_extensions_are_flattened_in_json() {
        let spec: NodeSpec = serde_json::from_str(
            r#"{"ssh_key_name":"id","template":"jammy","memory_mb":2048}"#,
        )
        .expect("spec should parse");

        assert_eq!(spec.extension_str("template"), Some("jammy"));
        assert_eq!(spec.extensions.get("memory_mb"), Some(&Value::from(2048)));
        assert_eq!(spec.bootstrap_command, None);
    }

    #[tokio::test]
    async fn pending_allocation_maps_errors_once_resolved() {
        let pending: PendingAllocation<'_, BackendError> =
            PendingAllocation::new(async { Err(BackendError::Validation(String::from("x"))) });

        let err = pending
            .map_err(|err| err.to_string())
            .resolve()
            .await
            .expect_err("should fail");

        assert_eq!(err, "missing or empty field: x");
    }
}
