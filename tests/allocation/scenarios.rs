//! BDD scenarios for the allocation lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{AllocationContext, allocation_context};

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Keep a successful cluster when the policy is never"
)]
fn scenario_keep_with_never(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Keep a successful cluster under the default policy"
)]
fn scenario_keep_on_success(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Destroy a successful cluster when the policy is always"
)]
fn scenario_destroy_always(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Destroy the cluster when a node fails to provision"
)]
fn scenario_node_failure(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Destroy a rejected cluster even when the policy is never"
)]
fn scenario_rejected(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Leave a cluster whose body failed when the policy is never"
)]
fn scenario_body_failure_never(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Report destruction failures after a successful body"
)]
fn scenario_destruction_failure(allocation_context: AllocationContext) {
    drop(allocation_context);
}

#[scenario(
    path = "tests/features/allocation.feature",
    name = "Expose the cluster to the body"
)]
fn scenario_body_sees_cluster(allocation_context: AllocationContext) {
    drop(allocation_context);
}
