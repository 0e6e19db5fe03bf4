//! Builders for the Kubernetes objects the engine owns: server pods,
//! per-server services, the introspector job and its output ConfigMap.
//! Creation steps are idempotent by comparing the generated spec hash
//! against the observed object.

use crate::crds::{Channel, Domain, ServerPod};
use crate::kubernetes::KubernetesFacade;
use crate::labels::{
    operator_managed_selector, to_external_service_name, to_introspector_config_map_name,
    to_job_introspector_name, to_server_pod_name, to_server_service_name, CLUSTERNAME_LABEL,
    CREATEDBYOPERATOR_LABEL, DOMAINUID_LABEL, INTROSPECTION_STATE_LABEL, JOBNAME_LABEL,
    SERVERNAME_LABEL, SHA256_ANNOTATION,
};
use crate::presence::DomainPresenceInfo;
use crate::types::Result;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::info;

const WEBLOGIC_CONTAINER_NAME: &str = "weblogic-server";
const DEFAULT_LISTEN_PORT: i32 = 7001;

fn operator_labels(domain_uid: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(DOMAINUID_LABEL.to_string(), domain_uid.to_string());
    labels.insert(CREATEDBYOPERATOR_LABEL.to_string(), "true".to_string());
    labels
}

/// Merges environment lists; entries in `overrides` win by name.
fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = base.to_vec();
    for var in overrides {
        match merged.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

/// The server-pod customizations that apply to one server, most specific
/// last so its entries win.
fn effective_server_pod(domain: &Domain, cluster_name: Option<&str>, server_name: &str) -> ServerPod {
    let mut effective = domain.spec.server_pod.clone().unwrap_or_default();
    let layers = [
        cluster_name
            .and_then(|name| domain.spec.cluster(name))
            .and_then(|c| c.server_pod.clone()),
        domain
            .spec
            .managed_server(server_name)
            .and_then(|s| s.server_pod.clone()),
    ];
    for layer in layers.into_iter().flatten() {
        effective.env = merge_env(&effective.env, &layer.env);
        effective.labels.extend(layer.labels);
        effective.annotations.extend(layer.annotations);
        if layer.shutdown.is_some() {
            effective.shutdown = layer.shutdown;
        }
    }
    effective
}

fn effective_restart_version(
    domain: &Domain,
    cluster_name: Option<&str>,
    server_name: &str,
) -> Option<String> {
    domain
        .spec
        .managed_server(server_name)
        .and_then(|s| s.restart_version.clone())
        .or_else(|| {
            cluster_name
                .and_then(|name| domain.spec.cluster(name))
                .and_then(|c| c.restart_version.clone())
        })
        .or_else(|| domain.spec.restart_version.clone())
}

/// Hash of the parts of a pod the operator computes; recorded as an
/// annotation and compared to decide whether a pod must be recycled.
pub fn pod_spec_hash(pod: &Pod) -> String {
    let payload = json!({
        "spec": pod.spec,
        "labels": pod.metadata.labels,
    });
    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("{digest:x}")
}

fn observed_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SHA256_ANNOTATION))
        .map(String::as_str)
}

/// Builds the pod for one WebLogic server.
pub fn server_pod(
    domain: &Domain,
    server_name: &str,
    cluster_name: Option<&str>,
    listen_port: Option<i32>,
) -> Pod {
    let domain_uid = domain.domain_uid();
    let namespace = domain.namespace().unwrap_or_default();
    let customization = effective_server_pod(domain, cluster_name, server_name);

    let mut labels = operator_labels(&domain_uid);
    labels.insert(SERVERNAME_LABEL.to_string(), server_name.to_string());
    if let Some(cluster) = cluster_name {
        labels.insert(CLUSTERNAME_LABEL.to_string(), cluster.to_string());
    }
    if let Some(version) = effective_restart_version(domain, cluster_name, server_name) {
        labels.insert("weblogic.restartVersion".to_string(), version);
    }
    labels.extend(customization.labels.clone());

    let mut env = vec![
        EnvVar {
            name: "DOMAIN_UID".to_string(),
            value: Some(domain_uid.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "SERVER_NAME".to_string(),
            value: Some(server_name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "SERVER_OUT_IN_POD_LOG".to_string(),
            value: Some(domain.spec.include_server_out_in_pod_log.to_string()),
            ..Default::default()
        },
    ];
    env = merge_env(&env, &customization.env);

    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(to_server_pod_name(&domain_uid, server_name)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(customization.annotations.clone().into_iter().collect()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: WEBLOGIC_CONTAINER_NAME.to_string(),
                image: domain.spec.image.clone(),
                command: Some(vec!["/weblogic-operator/scripts/startServer.sh".to_string()]),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    container_port: listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            image_pull_secrets: if domain.spec.image_pull_secrets.is_empty() {
                None
            } else {
                Some(domain.spec.image_pull_secrets.clone())
            },
            ..Default::default()
        }),
        status: None,
    };

    let hash = pod_spec_hash(&pod);
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SHA256_ANNOTATION.to_string(), hash);
    pod
}

/// Builds the ClusterIP service in front of one server.
pub fn server_service(domain: &Domain, server_name: &str, listen_port: Option<i32>) -> Service {
    let domain_uid = domain.domain_uid();
    let mut selector = BTreeMap::new();
    selector.insert(DOMAINUID_LABEL.to_string(), domain_uid.clone());
    selector.insert(SERVERNAME_LABEL.to_string(), server_name.to_string());

    let mut labels = operator_labels(&domain_uid);
    labels.insert(SERVERNAME_LABEL.to_string(), server_name.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(to_server_service_name(&domain_uid, server_name)),
            namespace: domain.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Builds the NodePort service exposing configured admin channels.
pub fn external_admin_service(domain: &Domain, admin_server_name: &str, channels: &[Channel]) -> Service {
    let domain_uid = domain.domain_uid();
    let mut selector = BTreeMap::new();
    selector.insert(DOMAINUID_LABEL.to_string(), domain_uid.clone());
    selector.insert(SERVERNAME_LABEL.to_string(), admin_server_name.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(to_external_service_name(&domain_uid, admin_server_name)),
            namespace: domain.namespace(),
            labels: Some(operator_labels(&domain_uid)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector),
            ports: Some(
                channels
                    .iter()
                    .map(|channel| ServicePort {
                        name: Some(channel.channel_name.clone()),
                        port: DEFAULT_LISTEN_PORT,
                        node_port: channel.node_port,
                        target_port: Some(IntOrString::Int(DEFAULT_LISTEN_PORT)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// Builds the introspector job for a domain.
pub fn introspector_job(domain: &Domain, active_deadline_seconds: u64) -> Job {
    let domain_uid = domain.domain_uid();
    let job_name = to_job_introspector_name(&domain_uid);

    let mut pod_labels = operator_labels(&domain_uid);
    pod_labels.insert(JOBNAME_LABEL.to_string(), job_name.clone());

    let mut env = vec![EnvVar {
        name: "DOMAIN_UID".to_string(),
        value: Some(domain_uid.clone()),
        ..Default::default()
    }];
    if let Some(secret) = &domain.spec.web_logic_credentials_secret {
        env.push(EnvVar {
            name: "CREDENTIALS_SECRET_NAME".to_string(),
            value: secret.name.clone(),
            ..Default::default()
        });
    }

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.clone()),
            namespace: domain.namespace(),
            labels: Some(operator_labels(&domain_uid)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            active_deadline_seconds: Some(active_deadline_seconds as i64),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: job_name,
                        image: domain.spec.image.clone(),
                        command: Some(vec![
                            "/weblogic-operator/scripts/introspectDomain.sh".to_string()
                        ]),
                        env: Some(env),
                        ..Default::default()
                    }],
                    image_pull_secrets: if domain.spec.image_pull_secrets.is_empty() {
                        None
                    } else {
                        Some(domain.spec.image_pull_secrets.clone())
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Builds the ConfigMap holding the introspection output files.
pub fn introspector_config_map(
    domain: &Domain,
    data: BTreeMap<String, String>,
    introspect_version: &str,
) -> ConfigMap {
    let domain_uid = domain.domain_uid();
    let mut labels = operator_labels(&domain_uid);
    labels.insert(
        INTROSPECTION_STATE_LABEL.to_string(),
        introspect_version.to_string(),
    );
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(to_introspector_config_map_name(&domain_uid)),
            namespace: domain.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Name of the per-namespace ConfigMap carrying the operator scripts
/// that server pods and introspector jobs mount.
pub const SCRIPT_CONFIG_MAP_NAME: &str = "weblogic-domain-cm";

const SCRIPTS: &[(&str, &str)] = &[
    (
        "startServer.sh",
        "#!/bin/bash\nexec ${DOMAIN_HOME}/bin/startWebLogic.sh\n",
    ),
    (
        "introspectDomain.sh",
        "#!/bin/bash\nexec /weblogic-operator/introspector/introspectDomain.py\n",
    ),
];

/// Builds the per-namespace script ConfigMap.
pub fn script_config_map(namespace: &str) -> ConfigMap {
    let mut labels = BTreeMap::new();
    labels.insert(CREATEDBYOPERATOR_LABEL.to_string(), "true".to_string());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(SCRIPT_CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(
            SCRIPTS
                .iter()
                .map(|(name, body)| ((*name).to_string(), (*body).to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Step recreating the script ConfigMap after it was changed or deleted.
pub struct ScriptConfigMapStep {
    facade: std::sync::Arc<dyn KubernetesFacade>,
    namespace: String,
}

impl ScriptConfigMapStep {
    pub fn new(facade: std::sync::Arc<dyn KubernetesFacade>, namespace: &str) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            facade,
            namespace: namespace.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl crate::work::Step for ScriptConfigMapStep {
    fn name(&self) -> &str {
        "ScriptConfigMap"
    }

    async fn apply(&self, _packet: &mut crate::work::Packet) -> Result<crate::work::NextAction> {
        let desired = script_config_map(&self.namespace);
        match self
            .facade
            .get_config_map(&self.namespace, SCRIPT_CONFIG_MAP_NAME)
            .await?
        {
            Some(existing) if existing.data == desired.data => {}
            Some(_) => {
                self.facade
                    .patch_config_map(&self.namespace, SCRIPT_CONFIG_MAP_NAME, &desired)
                    .await?;
            }
            None => {
                self.facade.create_config_map(&self.namespace, &desired).await?;
            }
        }
        Ok(crate::work::NextAction::Continue)
    }
}

/// Creates the pod if absent, recycles it when the computed spec hash
/// differs from the observed one, and leaves it untouched otherwise.
pub async fn ensure_server_pod(
    facade: &dyn KubernetesFacade,
    info: &DomainPresenceInfo,
    desired: Pod,
    server_name: &str,
) -> Result<()> {
    let namespace = info.namespace();
    let pod_name = desired.name_any();
    let desired_hash = observed_hash(&desired).map(String::from);

    let existing = match info.server_pod(server_name) {
        Some(pod) => Some(pod),
        None => facade.get_pod(namespace, &pod_name).await?,
    };

    match existing {
        None => {
            let created = facade.create_pod(namespace, &desired).await?;
            info.set_server_pod(server_name, created);
            info!(
                namespace,
                domain_uid = info.domain_uid(),
                server = server_name,
                "created server pod"
            );
        }
        Some(current) => {
            if observed_hash(&current) != desired_hash.as_deref() {
                info.set_server_pod_being_deleted(server_name, true);
                facade.delete_pod(namespace, &pod_name).await?;
                info.remove_server_pod(server_name);
                let created = facade.create_pod(namespace, &desired).await?;
                info.set_server_pod_being_deleted(server_name, false);
                info.set_server_pod(server_name, created);
                info!(
                    namespace,
                    domain_uid = info.domain_uid(),
                    server = server_name,
                    "recycled server pod after spec change"
                );
            }
        }
    }
    Ok(())
}

/// Creates the service if it does not exist; services are stable, so an
/// existing one is left alone.
pub async fn ensure_service(
    facade: &dyn KubernetesFacade,
    info: &DomainPresenceInfo,
    desired: Service,
) -> Result<()> {
    let namespace = info.namespace();
    let service_name = desired.name_any();
    let existing = match info.service(&service_name) {
        Some(service) => Some(service),
        None => facade.get_service(namespace, &service_name).await?,
    };
    if existing.is_none() {
        let created = facade.create_service(namespace, &desired).await?;
        info.set_service_from_event(&service_name, created);
    }
    Ok(())
}

/// Deletes every pod, service, job and ConfigMap the operator created
/// for the domain.
pub async fn delete_domain_resources(
    facade: &dyn KubernetesFacade,
    info: &DomainPresenceInfo,
) -> Result<()> {
    let namespace = info.namespace();
    let selector = operator_managed_selector(info.domain_uid());

    for pod in facade.list_pods(namespace, &selector).await? {
        if let Some(server) = crate::kubernetes::pod_label(&pod, SERVERNAME_LABEL) {
            info.set_server_pod_being_deleted(server, true);
        }
        facade.delete_pod(namespace, &pod.name_any()).await?;
    }
    for service in facade.list_services(namespace, &selector).await? {
        facade.delete_service(namespace, &service.name_any()).await?;
    }
    for job in facade.list_jobs(namespace, &selector).await? {
        facade.delete_job(namespace, &job.name_any()).await?;
    }
    facade
        .delete_config_map(namespace, &to_introspector_config_map_name(info.domain_uid()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::DomainSpec;

    fn domain() -> Domain {
        let mut domain = Domain::new(
            "sample",
            DomainSpec {
                domain_uid: Some("uid1".into()),
                image: Some("store/weblogic:12.2.1.4".into()),
                ..Default::default()
            },
        );
        domain.metadata.namespace = Some("ns".into());
        domain
    }

    #[test]
    fn server_pod_carries_operator_labels_and_hash() {
        let pod = server_pod(&domain(), "managed-server1", Some("cluster-1"), None);
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(DOMAINUID_LABEL).unwrap(), "uid1");
        assert_eq!(labels.get(SERVERNAME_LABEL).unwrap(), "managed-server1");
        assert_eq!(labels.get(CREATEDBYOPERATOR_LABEL).unwrap(), "true");
        assert!(pod
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .contains_key(SHA256_ANNOTATION));
    }

    #[test]
    fn env_change_changes_the_pod_hash() {
        let base = server_pod(&domain(), "managed-server1", None, None);

        let mut changed_domain = domain();
        changed_domain.spec.server_pod = Some(ServerPod {
            env: vec![EnvVar {
                name: "JAVA_OPTIONS".into(),
                value: Some("-Dweblogic.StdoutDebugEnabled=true".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        let changed = server_pod(&changed_domain, "managed-server1", None, None);

        assert_ne!(observed_hash(&base), observed_hash(&changed));
    }

    #[test]
    fn restart_version_change_changes_the_pod_hash() {
        let base = server_pod(&domain(), "managed-server1", None, None);
        let mut bumped_domain = domain();
        bumped_domain.spec.restart_version = Some("2".into());
        let bumped = server_pod(&bumped_domain, "managed-server1", None, None);
        assert_ne!(observed_hash(&base), observed_hash(&bumped));
    }

    #[test]
    fn server_override_env_wins_over_domain_env() {
        let mut d = domain();
        d.spec.server_pod = Some(ServerPod {
            env: vec![EnvVar {
                name: "JAVA_OPTIONS".into(),
                value: Some("domain".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        d.spec.managed_servers.push(crate::crds::ManagedServerSpec {
            server_name: "ms1".into(),
            server_pod: Some(ServerPod {
                env: vec![EnvVar {
                    name: "JAVA_OPTIONS".into(),
                    value: Some("server".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        });
        let pod = server_pod(&d, "ms1", None, None);
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let java_options = env.iter().find(|e| e.name == "JAVA_OPTIONS").unwrap();
        assert_eq!(java_options.value.as_deref(), Some("server"));
    }

    #[test]
    fn introspector_job_is_labeled_for_dispatch() {
        let job = introspector_job(&domain(), 120);
        assert_eq!(job.metadata.name.as_deref(), Some("uid1-introspector"));
        let pod_labels = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(pod_labels.get(JOBNAME_LABEL).unwrap(), "uid1-introspector");
        assert_eq!(pod_labels.get(DOMAINUID_LABEL).unwrap(), "uid1");
    }
}
