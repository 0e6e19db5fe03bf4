//! The Kubernetes surface the engine drives. Steps and watch handlers go
//! through [`KubernetesFacade`] so tests can substitute an in-memory
//! API server; the production implementation wraps [`kube::Client`].

use crate::crds::{Domain, DomainStatus};
use crate::labels::JOBNAME_LABEL;
use crate::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, Condition};
use kube::Client;
use serde_json::json;
use std::time::Duration;

/// Compares two object metadatas: is the first strictly newer?
/// `resourceVersion` is compared numerically when both values parse,
/// falling back to `creationTimestamp`.
pub fn is_first_newer(first: &ObjectMeta, second: &ObjectMeta) -> bool {
    let versions = (
        first.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()),
        second.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()),
    );
    if let (Some(a), Some(b)) = versions {
        return a > b;
    }
    match (&first.creation_timestamp, &second.creation_timestamp) {
        (Some(a), Some(b)) => a.0 > b.0,
        _ => false,
    }
}

/// Value of a pod label, if present.
pub fn pod_label<'a>(pod: &'a Pod, label: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .map(String::as_str)
}

/// Whether the pod reports the `Ready` condition true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Async access to the cluster, namespace-scoped throughout.
#[async_trait]
pub trait KubernetesFacade: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap>;
    async fn patch_config_map(&self, namespace: &str, name: &str, config_map: &ConfigMap)
        -> Result<ConfigMap>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>>;

    /// The pod created for the given job, if it has been scheduled yet.
    async fn find_job_pod(&self, namespace: &str, job_name: &str) -> Result<Option<Pod>>;
    async fn read_pod_log(&self, namespace: &str, pod_name: &str) -> Result<String>;

    async fn get_domain(&self, namespace: &str, name: &str) -> Result<Option<Domain>>;
    /// Writes the domain status through the status subresource.
    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<()>;

    /// Resolves when the pod reports ready; `Err(Timeout)` past the bound.
    async fn wait_for_pod_ready(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<()>;
    /// Resolves when the job completes; `Err(Introspection)` if it fails.
    async fn wait_for_job_complete(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Production facade backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeFacade {
    client: Client,
}

impl KubeFacade {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn domains(&self, namespace: &str) -> Api<Domain> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn pod_ready_condition() -> impl Condition<Pod> {
    |obj: Option<&Pod>| obj.map(is_pod_ready).unwrap_or(false)
}

fn job_finished_condition() -> impl Condition<Job> {
    |obj: Option<&Job>| {
        obj.and_then(|job| job.status.as_ref())
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
            })
            .unwrap_or(false)
    }
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl KubernetesFacade for KubeFacade {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.pods(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.services(namespace).list(&params).await?.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.services(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_maps(namespace).get_opt(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        Ok(self
            .config_maps(namespace)
            .create(&PostParams::default(), config_map)
            .await?)
    }

    async fn patch_config_map(
        &self,
        namespace: &str,
        name: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        Ok(self
            .config_maps(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(config_map))
            .await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.config_maps(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.jobs(namespace).get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        Ok(self.jobs(namespace).create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams::background();
        ignore_not_found(
            self.jobs(namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
        )
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.jobs(namespace).list(&params).await?.items)
    }

    async fn find_job_pod(&self, namespace: &str, job_name: &str) -> Result<Option<Pod>> {
        let selector = format!("{JOBNAME_LABEL}={job_name}");
        Ok(self.list_pods(namespace, &selector).await?.into_iter().next())
    }

    async fn read_pod_log(&self, namespace: &str, pod_name: &str) -> Result<String> {
        Ok(self
            .pods(namespace)
            .logs(pod_name, &LogParams::default())
            .await?)
    }

    async fn get_domain(&self, namespace: &str, name: &str) -> Result<Option<Domain>> {
        Ok(self.domains(namespace).get_opt(name).await?)
    }

    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<()> {
        self.domains(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let wait = await_condition(self.pods(namespace), name, pod_ready_condition());
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("pod {name} to become ready")))?
            .map_err(|e| Error::Internal(format!("watch for pod {name} failed: {e}")))?;
        Ok(())
    }

    async fn wait_for_job_complete(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let wait = await_condition(self.jobs(namespace), name, job_finished_condition());
        let job = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("job {name} to complete")))?
            .map_err(|e| Error::Internal(format!("watch for job {name} failed: {e}")))?;
        match job {
            Some(job) if job_failed(&job) => {
                Err(Error::Introspection(format!("job {name} failed")))
            }
            _ => Ok(()),
        }
    }
}
