//! Unit tests for the allocation lifecycle.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

use crate::backend::{BackendError, NodeSpec};
use crate::cluster::current_cluster;
use crate::test_support::{CONTEXT_LOCK, ScriptedBackend};

fn specs(names: &[&str]) -> NodeSpecs {
    names
        .iter()
        .map(|name| {
            let spec = NodeSpec::builder("id_covey")
                .build()
                .unwrap_or_else(|err| panic!("spec should build: {err}"));
            ((*name).to_owned(), spec)
        })
        .collect()
}

#[fixture]
fn backend() -> ScriptedBackend {
    ScriptedBackend::new()
}

fn orchestrator(backend: &ScriptedBackend) -> AllocationOrchestrator<ScriptedBackend> {
    AllocationOrchestrator::new(backend.clone()).with_origin_host("test-host")
}

fn options(policy: DestructionPolicy) -> AllocationOptions {
    AllocationOptions::default().with_destroy(policy)
}

#[rstest]
#[case("on-error", DestructionPolicy::OnError)]
#[case("on_error", DestructionPolicy::OnError)]
#[case("always", DestructionPolicy::Always)]
#[case(" never ", DestructionPolicy::Never)]
fn policies_parse(#[case] raw: &str, #[case] expected: DestructionPolicy) {
    assert_eq!(raw.parse::<DestructionPolicy>(), Ok(expected));
}

#[rstest]
fn unknown_policy_is_rejected() {
    let err = "sometimes"
        .parse::<DestructionPolicy>()
        .expect_err("not a policy");

    assert_eq!(err, UnknownPolicy(String::from("sometimes")));
}

#[rstest]
fn default_policy_is_on_error() {
    assert_eq!(DestructionPolicy::default(), DestructionPolicy::OnError);
    assert_eq!(DestructionPolicy::OnError.to_string(), "on-error");
}

#[rstest]
#[tokio::test]
async fn successful_allocation_builds_ordered_record(backend: ScriptedBackend) {
    let record = orchestrator(&backend)
        .allocate(&specs(&["web", "db", "cache"]), &AllocationOptions::default())
        .await
        .expect("allocation should succeed");

    assert!(record.identity.is_well_formed());
    assert_eq!(record.convention, CLUSTER_CONVENTION);
    assert_eq!(record.driver.name, ScriptedBackend::NAME);
    assert_eq!(record.allocation.host, "test-host");
    assert!(record.allocation.duration >= 0.0);
    assert_eq!(
        record.nodes.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["web", "db", "cache"]
    );
    assert_eq!(backend.resolved(), vec!["web", "db", "cache"]);
    assert!(backend.destroyed().is_empty(), "on-error keeps healthy clusters");
    assert_eq!(backend.live_nodes_of(&record.identity).len(), 3);
}

#[rstest]
#[tokio::test]
async fn never_policy_leaves_cluster_live(backend: ScriptedBackend) {
    let record = orchestrator(&backend)
        .allocate(&specs(&["a", "b"]), &options(DestructionPolicy::Never))
        .await
        .expect("allocation should succeed");

    assert_eq!(backend.live_nodes_of(&record.identity).len(), 2);
    assert!(backend.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn always_policy_destroys_successful_cluster(backend: ScriptedBackend) {
    let record = orchestrator(&backend)
        .allocate(&specs(&["a"]), &options(DestructionPolicy::Always))
        .await
        .expect("allocation should succeed");

    assert_eq!(backend.destroyed(), vec![record.identity.clone()]);
    assert!(backend.live_nodes_of(&record.identity).is_empty());
}

#[rstest]
#[tokio::test]
async fn always_policy_surfaces_destruction_failure(backend: ScriptedBackend) {
    backend.fail_destroy();

    let err = orchestrator(&backend)
        .allocate(&specs(&["a"]), &options(DestructionPolicy::Always))
        .await
        .expect_err("destruction failure should surface");

    let AllocateError::Destruction { cluster_id, source } = err else {
        panic!("expected destruction error, got {err:?}");
    };
    assert!(matches!(source, BackendError::Destruction { .. }));
    assert_eq!(backend.live_nodes_of(&cluster_id).len(), 1);
}

#[rstest]
#[case(DestructionPolicy::OnError)]
#[case(DestructionPolicy::Never)]
#[case(DestructionPolicy::Always)]
#[tokio::test]
async fn node_failure_stops_later_nodes_and_destroys(
    backend: ScriptedBackend,
    #[case] policy: DestructionPolicy,
) {
    backend.fail_node("b");

    let err = orchestrator(&backend)
        .allocate(&specs(&["a", "b", "c"]), &options(policy))
        .await
        .expect_err("node b should fail");

    let AllocateError::NodeProvisioning {
        cluster_id, node, ..
    } = err
    else {
        panic!("expected node provisioning error, got {err:?}");
    };
    assert_eq!(node, "b");
    assert_eq!(backend.started(), vec!["a", "b", "c"]);
    assert_eq!(backend.resolved(), vec!["a", "b"]);
    assert_eq!(backend.destroyed(), vec![cluster_id.clone()]);
    assert!(backend.live_nodes_of(&cluster_id).is_empty());
}

#[rstest]
#[tokio::test]
async fn destruction_failure_while_failing_keeps_original_error(backend: ScriptedBackend) {
    backend.fail_node("a");
    backend.fail_destroy();

    let err = orchestrator(&backend)
        .allocate(&specs(&["a"]), &AllocationOptions::default())
        .await
        .expect_err("node a should fail");

    assert!(
        matches!(err, AllocateError::NodeProvisioning { .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(backend.destroyed().len(), 1);
}

#[rstest]
#[tokio::test]
async fn rejected_start_runs_no_nodes_and_still_destroys(backend: ScriptedBackend) {
    backend.reject_start("too many nodes");

    let err = orchestrator(&backend)
        .allocate(&specs(&["a"]), &options(DestructionPolicy::Never))
        .await
        .expect_err("start should be rejected");

    assert!(matches!(err, AllocateError::Rejected { .. }));
    assert!(backend.started().is_empty());
    assert_eq!(backend.destroyed(), vec![err.cluster_id().clone()]);
}

#[rstest]
#[tokio::test]
async fn invalid_spec_is_rejected_before_any_start(backend: ScriptedBackend) {
    let mut invalid = specs(&["a", "b"]);
    if let Some(spec) = invalid.get_mut("b") {
        spec.ssh_key_name = String::from("  ");
    }

    let err = orchestrator(&backend)
        .allocate(&invalid, &AllocationOptions::default())
        .await
        .expect_err("blank key should be rejected");

    let AllocateError::Rejected { source, .. } = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(source, BackendError::Validation(String::from("ssh_key_name")));
    assert!(backend.started().is_empty());
}

#[rstest]
#[tokio::test]
async fn body_sees_cluster_and_scope_is_restored(backend: ScriptedBackend) {
    let _lock = CONTEXT_LOCK.lock().await;

    let (identity, seen) = orchestrator(&backend)
        .allocate_with(
            &specs(&["a"]),
            &AllocationOptions::default(),
            |context| async move {
                let seen = current_cluster();
                Ok::<_, BodyError>((context.record().identity.clone(), seen))
            },
        )
        .await
        .expect("allocation should succeed");

    let seen_record =
        ClusterRecord::from_json(&seen.expect("body should see a current cluster"))
            .expect("current cluster should parse");
    assert_eq!(seen_record.identity, identity);
    assert_eq!(current_cluster(), None);
    assert!(backend.destroyed().is_empty());
}

#[rstest]
#[tokio::test]
async fn failing_body_restores_scope_and_destroys(backend: ScriptedBackend) {
    let _lock = CONTEXT_LOCK.lock().await;

    let err = orchestrator(&backend)
        .allocate_with(
            &specs(&["a"]),
            &AllocationOptions::default(),
            |_context| async { Err::<(), BodyError>("tests failed".into()) },
        )
        .await
        .expect_err("body failure should surface");

    assert!(matches!(err, AllocateError::Body { .. }));
    assert!(err.to_string().contains("tests failed"));
    assert_eq!(current_cluster(), None);
    assert_eq!(backend.destroyed(), vec![err.cluster_id().clone()]);
}

#[rstest]
#[tokio::test]
async fn record_is_written_to_sink_before_body_runs(backend: ScriptedBackend) {
    let _lock = CONTEXT_LOCK.lock().await;
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("cluster.json")).expect("utf8 path");
    let sink_path = path.clone();

    let written = orchestrator(&backend)
        .allocate_with(
            &specs(&["a"]),
            &AllocationOptions::default().with_sink(ClusterSink::File(path.clone())),
            |context| async move {
                let on_disk = ClusterRecord::load(&sink_path)?;
                Ok::<_, BodyError>(on_disk == *context.record())
            },
        )
        .await
        .expect("allocation should succeed");

    assert!(written, "sink should hold the assembled record");
}

#[rstest]
#[tokio::test]
async fn standalone_destroy_reports_cluster_id(backend: ScriptedBackend) {
    let cluster_id = ClusterId::from("leftover");
    backend.add_live_node(&cluster_id, "vm");
    backend.fail_destroy();

    let err = orchestrator(&backend)
        .destroy(&cluster_id)
        .await
        .expect_err("destroy should fail");

    assert_eq!(err.cluster_id, cluster_id);
    assert!(err.to_string().contains("manual cleanup"));
}

#[rstest]
#[tokio::test]
async fn active_nodes_can_be_filtered_by_cluster(backend: ScriptedBackend) {
    let wanted = ClusterId::from("wanted");
    backend.add_live_node(&wanted, "vm-1");
    backend.add_live_node(&ClusterId::from("other"), "vm-2");
    let orchestrator = orchestrator(&backend);

    let all = orchestrator.active_nodes(None).await.expect("listing");
    let filtered = orchestrator
        .active_nodes(Some(&wanted))
        .await
        .expect("listing");

    assert_eq!(all.len(), 2);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered.first().map(|node| node.identity.as_str()), Some("vm-1"));
}
