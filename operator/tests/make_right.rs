//! End-to-end engine scenarios against the in-memory facade: adoption,
//! restart on spec change, scaling, policy promotion, bounded retry and
//! deletion.

mod common;

use common::{
    await_quiescence, test_domain, test_tuning, FakeKubernetes, TestDelegate, DOMAIN_UID,
    NAMESPACE,
};
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::WatchEvent;
use operator::crds::{ManagedServerSpec, ServerPod, ServerStartPolicy, RUNNING_STATE};
use operator::labels::{
    CREATEDBYOPERATOR_LABEL, DOMAINUID_LABEL, SERVERNAME_LABEL, SHA256_ANNOTATION,
};
use operator::processor::DomainProcessor;
use operator::KubernetesFacade;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (Arc<DomainProcessor>, Arc<FakeKubernetes>) {
    let facade = FakeKubernetes::new();
    let processor = DomainProcessor::new(TestDelegate::new(facade.clone(), test_tuning()));
    (processor, facade)
}

fn pod_hash(pod: &Pod) -> Option<String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SHA256_ANNOTATION))
        .cloned()
}

fn pod_uid(pod: &Pod) -> Option<String> {
    pod.metadata.uid.clone()
}

async fn adopt(processor: &Arc<DomainProcessor>, replicas: i32) {
    processor.dispatch_domain_watch(WatchEvent::Added(test_domain(replicas, 1, "10")));
    await_quiescence(processor, NAMESPACE).await;
}

#[tokio::test]
async fn adopting_a_domain_brings_up_introspector_admin_and_managed_servers() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;

    assert!(facade.job(NAMESPACE, "uid1-introspector").is_some());
    assert!(facade.pod(NAMESPACE, "uid1-admin-server").is_some());
    assert!(facade.pod(NAMESPACE, "uid1-managed-server1").is_some());
    assert!(facade.service(NAMESPACE, "uid1-managed-server1").is_some());

    // The periodic status updater publishes per-server state.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    let status = facade
        .domain_status(NAMESPACE, "sample")
        .expect("status written");
    let running: Vec<&str> = status
        .servers
        .iter()
        .filter(|s| s.state.as_deref() == Some(RUNNING_STATE))
        .map(|s| s.server_name.as_str())
        .collect();
    assert!(running.contains(&"admin-server"));
    assert!(running.contains(&"managed-server1"));
    assert_eq!(status.clusters[0].maximum_replicas, Some(5));
}

#[tokio::test]
async fn env_change_recycles_every_server_pod() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;

    let admin_before = facade.pod(NAMESPACE, "uid1-admin-server").unwrap();
    let managed_before = facade.pod(NAMESPACE, "uid1-managed-server1").unwrap();
    let jobs_before = facade.job_creates.load(Ordering::SeqCst);

    let mut changed = test_domain(1, 2, "20");
    changed.spec.server_pod = Some(ServerPod {
        env: vec![EnvVar {
            name: "JAVA_OPTIONS".into(),
            value: Some("-Dweblogic.StdoutDebugEnabled=true".into()),
            ..Default::default()
        }],
        ..Default::default()
    });
    processor.dispatch_domain_watch(WatchEvent::Modified(changed));
    await_quiescence(&processor, NAMESPACE).await;

    let admin_after = facade.pod(NAMESPACE, "uid1-admin-server").unwrap();
    let managed_after = facade.pod(NAMESPACE, "uid1-managed-server1").unwrap();
    assert_ne!(pod_uid(&admin_before), pod_uid(&admin_after));
    assert_ne!(pod_uid(&managed_before), pod_uid(&managed_after));
    assert_ne!(pod_hash(&admin_before), pod_hash(&admin_after));
    assert_ne!(pod_hash(&managed_before), pod_hash(&managed_after));

    // No new introspection was needed and no failures were recorded.
    assert_eq!(facade.job_creates.load(Ordering::SeqCst), jobs_before);
    if let Some(status) = facade.domain_status(NAMESPACE, "sample") {
        assert_eq!(status.introspect_job_failure_count, 0);
    }
}

#[tokio::test]
async fn scale_up_adds_a_server_without_restarting_the_others() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;
    let managed_before = facade.pod(NAMESPACE, "uid1-managed-server1").unwrap();

    processor.dispatch_domain_watch(WatchEvent::Modified(test_domain(2, 2, "20")));
    await_quiescence(&processor, NAMESPACE).await;

    assert!(facade.pod(NAMESPACE, "uid1-managed-server2").is_some());
    let managed_after = facade.pod(NAMESPACE, "uid1-managed-server1").unwrap();
    assert_eq!(pod_uid(&managed_before), pod_uid(&managed_after));
}

#[tokio::test]
async fn always_promotion_with_one_replica_swaps_the_started_server() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;
    assert!(facade.pod(NAMESPACE, "uid1-managed-server1").is_some());

    let mut promoted = test_domain(1, 2, "20");
    promoted.spec.managed_servers = vec![ManagedServerSpec {
        server_name: "managed-server3".into(),
        server_start_policy: Some(ServerStartPolicy::Always),
        ..Default::default()
    }];
    processor.dispatch_domain_watch(WatchEvent::Modified(promoted));
    await_quiescence(&processor, NAMESPACE).await;

    assert!(facade.pod(NAMESPACE, "uid1-managed-server3").is_some());
    assert!(facade.pod(NAMESPACE, "uid1-managed-server1").is_none());
}

#[tokio::test]
async fn duplicate_modified_event_runs_exactly_one_plan() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;

    processor.dispatch_domain_watch(WatchEvent::Modified(test_domain(2, 2, "20")));
    await_quiescence(&processor, NAMESPACE).await;
    let creates_after_first = facade.pod_creates.load(Ordering::SeqCst);
    let managed2 = facade.pod(NAMESPACE, "uid1-managed-server2").unwrap();

    // Same event replayed: classified as metadata-only and absorbed.
    processor.dispatch_domain_watch(WatchEvent::Modified(test_domain(2, 2, "20")));
    await_quiescence(&processor, NAMESPACE).await;

    assert_eq!(facade.pod_creates.load(Ordering::SeqCst), creates_after_first);
    assert_eq!(
        pod_uid(&managed2),
        pod_uid(&facade.pod(NAMESPACE, "uid1-managed-server2").unwrap())
    );
}

#[tokio::test]
async fn stale_modified_event_is_ignored() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;

    // Older resourceVersion than the cached domain: replayed history.
    processor.dispatch_domain_watch(WatchEvent::Modified(test_domain(2, 2, "5")));
    await_quiescence(&processor, NAMESPACE).await;

    assert!(facade.pod(NAMESPACE, "uid1-managed-server2").is_none());
}

#[tokio::test]
async fn introspector_failures_retry_up_to_the_bound_until_a_version_change() {
    let (processor, facade) = engine();
    facade.fail_introspector.store(true, Ordering::SeqCst);

    processor.dispatch_domain_watch(WatchEvent::Added(test_domain(1, 1, "10")));
    // initial attempt + domainPresenceFailureRetryMaxCount retries at
    // one-second spacing
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(facade.job_creates.load(Ordering::SeqCst), 3);

    // The bound holds: no further fibers start on their own.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(facade.job_creates.load(Ordering::SeqCst), 3);

    // The recorded failures block spec changes that touch none of
    // image, restartVersion or introspectVersion.
    let status = facade.domain_status(NAMESPACE, "sample").unwrap();
    assert!(status.introspect_job_failure_count >= 3);
    let mut rescaled = test_domain(2, 2, "20");
    rescaled.status = Some(status.clone());
    processor.dispatch_domain_watch(WatchEvent::Modified(rescaled));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(facade.job_creates.load(Ordering::SeqCst), 3);

    // An introspectVersion change re-arms introspection.
    let mut rearmed = test_domain(1, 3, "30");
    rearmed.spec.introspect_version = Some("2".into());
    rearmed.status = Some(status);
    processor.dispatch_domain_watch(WatchEvent::Modified(rearmed));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(facade.job_creates.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn modified_during_a_running_plan_is_coalesced_into_a_follow_up() {
    let (processor, facade) = engine();
    facade.hold_introspector.store(true, Ordering::SeqCst);

    processor.dispatch_domain_watch(WatchEvent::Added(test_domain(1, 1, "10")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(processor.current_make_right_fibers(NAMESPACE).len(), 1);

    // Scale-up lands while the first plan is parked on the introspector.
    processor.dispatch_domain_watch(WatchEvent::Modified(test_domain(2, 2, "20")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(processor.current_make_right_fibers(NAMESPACE).len(), 1);

    facade.hold_introspector.store(false, Ordering::SeqCst);
    await_quiescence(&processor, NAMESPACE).await;

    // The coalesced replica count was honored.
    assert!(facade.pod(NAMESPACE, "uid1-managed-server1").is_some());
    assert!(facade.pod(NAMESPACE, "uid1-managed-server2").is_some());
}

#[tokio::test]
async fn deletion_tears_down_and_forgets_the_domain() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;
    assert!(!facade.pod_names(NAMESPACE).is_empty());

    processor.dispatch_domain_watch(WatchEvent::Deleted(test_domain(1, 1, "11")));
    await_quiescence(&processor, NAMESPACE).await;

    assert!(facade.pod_names(NAMESPACE).is_empty());
    assert!(facade.service(NAMESPACE, "uid1-managed-server1").is_none());
    assert!(processor.cache().get(NAMESPACE, DOMAIN_UID).is_none());

    // A late pod event for the dead domain does not revive it.
    let creates_before = facade.pod_creates.load(Ordering::SeqCst);
    let mut labels = BTreeMap::new();
    labels.insert(DOMAINUID_LABEL.to_string(), DOMAIN_UID.to_string());
    labels.insert(SERVERNAME_LABEL.to_string(), "managed-server1".to_string());
    labels.insert(CREATEDBYOPERATOR_LABEL.to_string(), "true".to_string());
    let stray = Pod {
        metadata: ObjectMeta {
            name: Some("uid1-managed-server1".into()),
            namespace: Some(NAMESPACE.into()),
            labels: Some(labels),
            resource_version: Some("99".into()),
            uid: Some("stray".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    processor.dispatch_pod_watch(WatchEvent::Added(stray));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(processor.cache().get(NAMESPACE, DOMAIN_UID).is_none());
    assert_eq!(facade.pod_creates.load(Ordering::SeqCst), creates_before);
}

#[tokio::test]
async fn pod_deleted_behind_the_operators_back_is_restored() {
    let (processor, facade) = engine();
    adopt(&processor, 1).await;
    let before = facade.pod(NAMESPACE, "uid1-managed-server1").unwrap();

    // Someone deletes the pod manually; the watcher reports it.
    facade.delete_pod(NAMESPACE, "uid1-managed-server1").await.unwrap();
    processor.dispatch_pod_watch(WatchEvent::Deleted(before));
    await_quiescence(&processor, NAMESPACE).await;

    assert!(facade.pod(NAMESPACE, "uid1-managed-server1").is_some());
}
