//! In-memory Kubernetes facade and fixtures shared by the engine tests.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Pod, PodCondition, PodStatus, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use operator::crds::{ClusterSpec, Domain, DomainSpec, DomainStatus};
use operator::processor::{DomainProcessor, DomainProcessorDelegate};
use operator::types::{Error, Result};
use operator::{KubernetesFacade, MainTuning};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "test-ns";
pub const DOMAIN_UID: &str = "uid1";

const INTROSPECTOR_LOG: &str = r#"Introspecting the domain
>>>  /u01/introspect/uid1/topology.yaml
domain:
  name: "base_domain"
  adminServerName: "admin-server"
  configuredClusters:
    - name: "cluster-1"
      dynamicServersConfig:
        serverNamePrefix: "managed-server"
        dynamicClusterSize: 5
        maxDynamicClusterSize: 5
  servers:
    - name: "admin-server"
      listenPort: 7001
>>> EOF
Done introspecting
"#;

#[derive(Default)]
struct FakeState {
    pods: HashMap<(String, String), Pod>,
    services: HashMap<(String, String), Service>,
    config_maps: HashMap<(String, String), ConfigMap>,
    jobs: HashMap<(String, String), Job>,
    domain_statuses: HashMap<(String, String), DomainStatus>,
}

/// An in-memory API server: creations land in maps, pods come up ready
/// immediately, and the introspector "runs" by serving a canned log.
pub struct FakeKubernetes {
    state: Mutex<FakeState>,
    counter: AtomicU64,
    pub fail_introspector: AtomicBool,
    /// While true, introspector jobs stay "running".
    pub hold_introspector: AtomicBool,
    pub job_creates: AtomicUsize,
    pub pod_creates: AtomicUsize,
}

impl FakeKubernetes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            counter: AtomicU64::new(1),
            fail_introspector: AtomicBool::new(false),
            hold_introspector: AtomicBool::new(false),
            job_creates: AtomicUsize::new(0),
            pod_creates: AtomicUsize::new(0),
        })
    }

    fn next_version(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn domain_status(&self, namespace: &str, name: &str) -> Option<DomainStatus> {
        self.state
            .lock()
            .unwrap()
            .domain_statuses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

/// Matches a Kubernetes label selector of the `k=v` / bare-key form.
fn selector_matches(selector: &str, labels: Option<&std::collections::BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector.split(',').all(|term| {
        let term = term.trim();
        if term.is_empty() {
            return true;
        }
        match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        }
    })
}

fn ready_pod_status() -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        start_time: Some(Time(chrono::Utc::now())),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[async_trait]
impl KubernetesFacade for FakeKubernetes {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector_matches(label_selector, pod.metadata.labels.as_ref())
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.pod_creates.fetch_add(1, Ordering::SeqCst);
        let mut created = pod.clone();
        let version = self.next_version();
        created.metadata.resource_version = Some(version.to_string());
        created.metadata.uid = Some(format!("pod-{version}"));
        created.status = Some(ready_pod_status());
        self.state
            .lock()
            .unwrap()
            .pods
            .insert((namespace.to_string(), created.name_any()), created.clone());
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .services
            .iter()
            .filter(|((ns, _), service)| {
                ns == namespace
                    && selector_matches(label_selector, service.metadata.labels.as_ref())
            })
            .map(|(_, service)| service.clone())
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut created = service.clone();
        created.metadata.resource_version = Some(self.next_version().to_string());
        created.metadata.uid = Some(format!("svc-{}", created.name_any()));
        self.state
            .lock()
            .unwrap()
            .services
            .insert((namespace.to_string(), created.name_any()), created.clone());
        Ok(created)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .services
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let mut created = config_map.clone();
        created.metadata.resource_version = Some(self.next_version().to_string());
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), created.name_any()), created.clone());
        Ok(created)
    }

    async fn patch_config_map(
        &self,
        namespace: &str,
        name: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let mut patched = config_map.clone();
        patched.metadata.resource_version = Some(self.next_version().to_string());
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), patched.clone());
        Ok(patched)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        self.job_creates.fetch_add(1, Ordering::SeqCst);
        let mut created = job.clone();
        let version = self.next_version();
        created.metadata.resource_version = Some(version.to_string());
        created.metadata.uid = Some(format!("job-{version}"));

        // The job controller would create the pod; do it eagerly so the
        // introspection output can be read.
        let job_name = created.name_any();
        let pod_labels = created
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone());
        let job_pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("{job_name}-zxcv1")),
                namespace: Some(namespace.to_string()),
                labels: pod_labels,
                resource_version: Some(self.next_version().to_string()),
                uid: Some(format!("jobpod-{version}")),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut state = self.state.lock().unwrap();
        state
            .pods
            .insert((namespace.to_string(), job_pod.name_any()), job_pod);
        state
            .jobs
            .insert((namespace.to_string(), job_name), created.clone());
        Ok(created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|((ns, _), job)| {
                ns == namespace && selector_matches(label_selector, job.metadata.labels.as_ref())
            })
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn find_job_pod(&self, namespace: &str, job_name: &str) -> Result<Option<Pod>> {
        let selector = format!("weblogic.jobName={job_name}");
        Ok(self.list_pods(namespace, &selector).await?.into_iter().next())
    }

    async fn read_pod_log(&self, _namespace: &str, _pod_name: &str) -> Result<String> {
        Ok(INTROSPECTOR_LOG.to_string())
    }

    async fn get_domain(&self, _namespace: &str, _name: &str) -> Result<Option<Domain>> {
        Ok(None)
    }

    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .domain_statuses
            .insert((namespace.to_string(), name.to_string()), status.clone());
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        _namespace: &str,
        _name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }

    async fn wait_for_job_complete(
        &self,
        _namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        while self.hold_introspector.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.fail_introspector.load(Ordering::SeqCst) {
            Err(Error::Introspection(format!("job {name} failed")))
        } else {
            Ok(())
        }
    }
}

pub struct TestDelegate {
    facade: Arc<FakeKubernetes>,
    tuning: MainTuning,
}

impl TestDelegate {
    pub fn new(facade: Arc<FakeKubernetes>, tuning: MainTuning) -> Arc<Self> {
        Arc::new(Self { facade, tuning })
    }
}

impl DomainProcessorDelegate for TestDelegate {
    fn kubernetes(&self) -> Arc<dyn KubernetesFacade> {
        self.facade.clone()
    }

    fn is_namespace_running(&self, _namespace: &str) -> bool {
        true
    }

    fn tuning(&self) -> MainTuning {
        self.tuning
    }
}

pub fn test_tuning() -> MainTuning {
    MainTuning {
        initial_short_delay: 1,
        status_update_timeout_seconds: 5,
        domain_presence_failure_retry_seconds: 1,
        domain_presence_failure_retry_max_count: 2,
        introspector_job_active_deadline_seconds: 30,
    }
}

/// A domain with one dynamic cluster, versioned so watch events look
/// fresh to the staleness check.
pub fn test_domain(replicas: i32, generation: i64, resource_version: &str) -> Domain {
    let mut domain = Domain::new(
        "sample",
        DomainSpec {
            domain_uid: Some(DOMAIN_UID.to_string()),
            image: Some("store/weblogic:12.2.1.4".to_string()),
            clusters: vec![ClusterSpec {
                cluster_name: "cluster-1".to_string(),
                replicas: Some(replicas),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    domain.metadata.namespace = Some(NAMESPACE.to_string());
    domain.metadata.generation = Some(generation);
    domain.metadata.resource_version = Some(resource_version.to_string());
    domain.metadata.uid = Some("domain-uid".to_string());
    domain
}

/// Waits until the namespace's make-right gate stays empty.
pub async fn await_quiescence(processor: &Arc<DomainProcessor>, namespace: &str) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut consecutive_idle = 0;
    for _ in 0..200 {
        if processor.current_make_right_fibers(namespace).is_empty() {
            consecutive_idle += 1;
            if consecutive_idle >= 4 {
                return;
            }
        } else {
            consecutive_idle = 0;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("make-right work did not quiesce");
}
