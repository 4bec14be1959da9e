//! BDD step definitions for the allocation lifecycle.

use covey::test_support::CONTEXT_LOCK;
use covey::{
    AllocateError, AllocationOptions, AllocationOrchestrator, BackendError, BodyError,
    ClusterRecord, current_cluster,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    AllocationContext, AllocationOutcome, FailureKind, parse_failure_kind, parse_policy,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a scripted backend")]
fn scripted_backend(allocation_context: &AllocationContext) {
    assert!(allocation_context.backend.live_clusters().is_empty());
}

#[given("nodes \"{names}\"")]
fn nodes(allocation_context: &AllocationContext, names: String) {
    allocation_context.add_nodes(&names);
}

#[given("node \"{name}\" fails to provision")]
fn node_fails(allocation_context: &AllocationContext, name: String) {
    allocation_context.backend.fail_node(name.trim());
}

#[given("the backend rejects the request")]
fn backend_rejects(allocation_context: &AllocationContext) {
    allocation_context.backend.reject_start("quota exceeded");
}

#[given("destruction fails")]
fn destruction_fails(allocation_context: &AllocationContext) {
    allocation_context.backend.fail_destroy();
}

#[given("the body fails")]
fn body_fails(allocation_context: &AllocationContext) {
    allocation_context.state().body_fails = true;
}

#[given("the destruction policy \"{policy}\"")]
fn destruction_policy(allocation_context: &AllocationContext, policy: String) {
    allocation_context.state().policy = parse_policy(&policy);
}

#[when("I allocate the cluster")]
fn allocate_cluster(allocation_context: &AllocationContext) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let (specs, policy, fails) = {
        let state = allocation_context.state();
        (state.specs.clone(), state.policy, state.body_fails)
    };
    let orchestrator =
        AllocationOrchestrator::new(allocation_context.backend.clone()).with_origin_host("bdd-host");
    let options = AllocationOptions::default().with_destroy(policy);

    let (result, seen_by_body, current_after) = runtime.block_on(async {
        let _lock = CONTEXT_LOCK.lock().await;
        let mut seen = None;
        let result = orchestrator
            .allocate_with(&specs, &options, |context| {
                seen = current_cluster();
                let record = context.into_record();
                async move {
                    if fails {
                        Err(BodyError::from("scripted body failure"))
                    } else {
                        Ok(record)
                    }
                }
            })
            .await;
        (result, seen, current_cluster())
    });

    let outcome = match result {
        Ok(record) => AllocationOutcome::Success(record),
        Err(err) => AllocationOutcome::Failure {
            cluster_id: err.cluster_id().clone(),
            kind: failure_kind(&err),
            message: err.to_string(),
        },
    };

    let mut state = allocation_context.state();
    state.seen_by_body = seen_by_body;
    state.current_after = current_after;
    state.outcome = Some(outcome);
    Ok(())
}

#[then("the allocation succeeds")]
fn allocation_succeeds(allocation_context: &AllocationContext) -> Result<(), StepError> {
    match allocation_context.outcome() {
        AllocationOutcome::Success(_) => Ok(()),
        AllocationOutcome::Failure { message, .. } => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
    }
}

#[then("the allocation fails with \"{kind}\"")]
fn allocation_fails_with(
    allocation_context: &AllocationContext,
    kind: String,
) -> Result<(), StepError> {
    let expected = parse_failure_kind(kind.trim());
    let AllocationOutcome::Failure { kind: actual, message, .. } = allocation_context.outcome()
    else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {actual:?}: {message}"
        )))
    }
}

#[then("the record lists nodes \"{names}\"")]
fn record_lists_nodes(
    allocation_context: &AllocationContext,
    names: String,
) -> Result<(), StepError> {
    let AllocationOutcome::Success(record) = allocation_context.outcome() else {
        return Err(StepError::Assertion(String::from("expected a record")));
    };
    let expected: Vec<&str> = names.split(',').map(str::trim).collect();
    let actual: Vec<&str> = record.nodes.keys().map(String::as_str).collect();
    if actual == expected && record.driver.name == "scripted" {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected nodes {expected:?} from the scripted driver, got {actual:?} from {}",
            record.driver.name
        )))
    }
}

#[then("the cluster is still live")]
fn cluster_still_live(allocation_context: &AllocationContext) -> Result<(), StepError> {
    let outcome = allocation_context.outcome();
    let cluster_id = outcome.cluster_id();
    let backend = &allocation_context.backend;
    if backend.destroyed().is_empty() && !backend.live_nodes_of(cluster_id).is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "cluster {cluster_id} should be live; destroyed calls: {:?}",
            backend.destroyed()
        )))
    }
}

#[then("the cluster is destroyed")]
fn cluster_destroyed(allocation_context: &AllocationContext) -> Result<(), StepError> {
    let outcome = allocation_context.outcome();
    let destroyed = allocation_context.backend.destroyed();
    if destroyed == vec![outcome.cluster_id().clone()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected exactly one destroy of {}, got {destroyed:?}",
            outcome.cluster_id()
        )))
    }
}

#[then("node \"{name}\" was never awaited")]
fn node_never_awaited(
    allocation_context: &AllocationContext,
    name: String,
) -> Result<(), StepError> {
    let resolved = allocation_context.backend.resolved();
    if resolved.iter().any(|node| node == name.trim()) {
        Err(StepError::Assertion(format!(
            "node {name} should not have been awaited; resolved {resolved:?}"
        )))
    } else {
        Ok(())
    }
}

#[then("the body saw the cluster record")]
fn body_saw_record(allocation_context: &AllocationContext) -> Result<(), StepError> {
    let outcome = allocation_context.outcome();
    let seen = allocation_context
        .state()
        .seen_by_body
        .clone()
        .ok_or_else(|| StepError::Assertion(String::from("body saw no current cluster")))?;
    let record = ClusterRecord::from_json(&seen)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if &record.identity == outcome.cluster_id() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "body saw cluster {}, expected {}",
            record.identity,
            outcome.cluster_id()
        )))
    }
}

#[then("no cluster is current afterwards")]
fn no_cluster_current(allocation_context: &AllocationContext) -> Result<(), StepError> {
    match allocation_context.state().current_after.clone() {
        None => Ok(()),
        Some(leftover) => Err(StepError::Assertion(format!(
            "current cluster leaked past the body: {leftover}"
        ))),
    }
}

const fn failure_kind(err: &AllocateError<BackendError>) -> FailureKind {
    match err {
        AllocateError::Rejected { .. } => FailureKind::Rejected,
        AllocateError::NodeProvisioning { .. } => FailureKind::Node,
        AllocateError::Sink { .. } => FailureKind::Sink,
        AllocateError::Body { .. } => FailureKind::Body,
        AllocateError::Destruction { .. } => FailureKind::Destruction,
    }
}
