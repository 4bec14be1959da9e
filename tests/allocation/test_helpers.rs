//! Shared fixtures for allocation BDD scenarios.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use covey::test_support::ScriptedBackend;
use covey::{ClusterId, ClusterRecord, DestructionPolicy, NodeSpec, NodeSpecs};
use rstest::fixture;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Rejected,
    Node,
    Sink,
    Body,
    Destruction,
}

#[derive(Clone, Debug)]
pub enum AllocationOutcome {
    Success(ClusterRecord),
    Failure {
        cluster_id: ClusterId,
        kind: FailureKind,
        message: String,
    },
}

impl AllocationOutcome {
    pub const fn cluster_id(&self) -> &ClusterId {
        match self {
            Self::Success(record) => &record.identity,
            Self::Failure { cluster_id, .. } => cluster_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScenarioState {
    pub specs: NodeSpecs,
    pub policy: DestructionPolicy,
    pub body_fails: bool,
    pub seen_by_body: Option<String>,
    pub current_after: Option<String>,
    pub outcome: Option<AllocationOutcome>,
}

/// Scenario state shared by every step; clones observe the same scenario.
#[derive(Clone, Debug, Default)]
pub struct AllocationContext {
    pub backend: ScriptedBackend,
    state: Arc<Mutex<ScenarioState>>,
}

impl AllocationContext {
    pub fn state(&self) -> MutexGuard<'_, ScenarioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_nodes(&self, names: &str) {
        let mut state = self.state();
        for name in names.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let spec = NodeSpec::builder(format!("id_{name}"))
                .build()
                .unwrap_or_else(|err| panic!("node spec should be valid: {err}"));
            state.specs.insert(name.to_owned(), spec);
        }
    }

    pub fn outcome(&self) -> AllocationOutcome {
        self.state()
            .outcome
            .clone()
            .unwrap_or_else(|| panic!("scenario has no allocation outcome yet"))
    }
}

#[fixture]
pub fn allocation_context() -> AllocationContext {
    AllocationContext::default()
}

pub fn parse_failure_kind(kind: &str) -> FailureKind {
    match kind {
        "rejected" => FailureKind::Rejected,
        "node" => FailureKind::Node,
        "sink" => FailureKind::Sink,
        "body" => FailureKind::Body,
        "destruction" => FailureKind::Destruction,
        other => panic!("unknown failure kind: {other}"),
    }
}

pub fn parse_policy(policy: &str) -> DestructionPolicy {
    policy
        .parse()
        .unwrap_or_else(|err| panic!("scenario policy should parse: {err}"))
}
