//! Scripted doubles for commands and backends, plus locks for tests that
//! touch process-wide state.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::backend::{
    ActiveNode, Backend, BackendError, BackendFuture, NodeResult, NodeSpecs, PendingAllocation,
    PendingAllocations, SshDetails,
};
use crate::cluster::ClusterId;
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::pool::Resource;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command runner replaying queued outputs, oldest first.
///
/// Clones share the same queue, so a test can keep a handle while a backend
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// One call seen by [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program that was requested.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Program and arguments joined by spaces.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Runner with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made so far, oldest first.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Number of responses not yet consumed.
    #[must_use]
    pub fn pending_responses(&self) -> usize {
        lock(&self.responses).len()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Queues a failure with the given exit code.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Queues an arbitrary output.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Minimal pooled resource for exercising pools and reconciliation.
#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TestSlot {
    /// Resource id.
    pub id: String,
}

impl TestSlot {
    /// Creates a slot with the given id.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self { id: id.to_owned() }
    }
}

impl Resource for TestSlot {
    fn resource_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Default)]
struct BackendState {
    live: Vec<ActiveNode>,
    reject_start: Option<String>,
    fail_node: Option<String>,
    fail_destroy: bool,
    fail_listing: bool,
    started: Vec<String>,
    resolved: Vec<String>,
    destroyed: Vec<ClusterId>,
}

/// In-memory backend whose failures are scripted per test.
///
/// Started nodes become live immediately; destroying a cluster removes its
/// nodes unless destruction is scripted to fail.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<BackendState>>,
}

impl ScriptedBackend {
    /// Name reported by [`Backend::name`].
    pub const NAME: &'static str = "scripted";

    /// Creates a backend with no live nodes and no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next start call fail with [`BackendError::Rejected`].
    pub fn reject_start(&self, message: &str) {
        lock(&self.state).reject_start = Some(message.to_owned());
    }

    /// Makes resolving the named node fail.
    pub fn fail_node(&self, name: &str) {
        lock(&self.state).fail_node = Some(name.to_owned());
    }

    /// Makes every destroy call fail and leave the nodes live.
    pub fn fail_destroy(&self) {
        lock(&self.state).fail_destroy = true;
    }

    /// Makes node listing fail.
    pub fn fail_listing(&self) {
        lock(&self.state).fail_listing = true;
    }

    /// Registers a live node created elsewhere.
    pub fn add_live_node(&self, cluster_id: &ClusterId, identity: &str) {
        lock(&self.state).live.push(ActiveNode {
            cluster_id: cluster_id.clone(),
            identity: identity.to_owned(),
        });
    }

    /// Live nodes belonging to `cluster_id`.
    #[must_use]
    pub fn live_nodes_of(&self, cluster_id: &ClusterId) -> Vec<ActiveNode> {
        lock(&self.state)
            .live
            .iter()
            .filter(|node| &node.cluster_id == cluster_id)
            .cloned()
            .collect()
    }

    /// Every cluster id that currently has a live node.
    #[must_use]
    pub fn live_clusters(&self) -> BTreeSet<ClusterId> {
        lock(&self.state)
            .live
            .iter()
            .map(|node| node.cluster_id.clone())
            .collect()
    }

    /// Node names whose start step ran, in order.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    /// Node names whose pending allocation was resolved, in order.
    #[must_use]
    pub fn resolved(&self) -> Vec<String> {
        lock(&self.state).resolved.clone()
    }

    /// Clusters passed to destroy, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<ClusterId> {
        lock(&self.state).destroyed.clone()
    }
}

impl Backend for ScriptedBackend {
    type Error = BackendError;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn find_active_nodes(&self) -> BackendFuture<'_, Vec<ActiveNode>, Self::Error> {
        let state = lock(&self.state);
        let outcome = if state.fail_listing {
            Err(BackendError::Provider {
                message: String::from("scripted listing failure"),
            })
        } else {
            Ok(state.live.clone())
        };
        Box::pin(async move { outcome })
    }

    fn start_allocating_nodes<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> BackendFuture<'a, PendingAllocations<'a, Self::Error>, Self::Error> {
        Box::pin(async move {
            if let Some(message) = lock(&self.state).reject_start.clone() {
                return Err(BackendError::Rejected { message });
            }
            for spec in specs.values() {
                spec.validate()?;
            }

            let mut pending = PendingAllocations::new();
            for (index, (name, spec)) in specs.iter().enumerate() {
                let identity = format!("{name}_{cluster_id}");
                {
                    let mut state = lock(&self.state);
                    state.started.push(name.clone());
                    state.live.push(ActiveNode {
                        cluster_id: cluster_id.clone(),
                        identity: identity.clone(),
                    });
                }

                let shared = Arc::clone(&self.state);
                let node = name.clone();
                let result = NodeResult {
                    identity,
                    public_ip_address: format!("10.0.0.{}", index + 2),
                    ssh: SshDetails {
                        user: spec
                            .username
                            .clone()
                            .unwrap_or_else(|| String::from("scripted")),
                        private_key_name: spec.ssh_key_name.clone(),
                        public_host_key: String::from("scripted-host-key"),
                    },
                    extensions: Map::new(),
                };
                pending.insert(
                    name.clone(),
                    PendingAllocation::new(async move {
                        let mut guard = lock(&shared);
                        guard.resolved.push(node.clone());
                        if guard.fail_node.as_deref() == Some(node.as_str()) {
                            return Err(BackendError::Provisioning {
                                node,
                                message: String::from("scripted readiness failure"),
                            });
                        }
                        Ok(result)
                    }),
                );
            }
            Ok(pending)
        })
    }

    fn destroy_cluster<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroyed.push(cluster_id.clone());
            if state.fail_destroy {
                return Err(BackendError::Destruction {
                    cluster_id: cluster_id.to_string(),
                    message: String::from("scripted destruction failure"),
                });
            }
            state.live.retain(|node| &node.cluster_id != cluster_id);
            Ok(())
        })
    }
}

/// Serialises tests that read or scope the process-wide current cluster.
pub static CONTEXT_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Serialises tests that change environment variables.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Restores the variables it changed when dropped.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets `pairs` for as long as the guard lives.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: `ENV_LOCK` is held, so no other test touches the environment.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: `_guard` still holds `ENV_LOCK`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
