//! Domain status assembly and the steps that write it back through the
//! status subresource.

use crate::crds::{
    DomainCondition, DomainStatus, ServerHealth, ServerStatus, RUNNING_STATE, SHUTDOWN_STATE,
    STARTING_STATE,
};
use crate::kubernetes::{is_pod_ready, KubernetesFacade};
use crate::policy;
use crate::types::Result;
use crate::work::{NextAction, Packet, Step};
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Packet entry: per-server textual state.
pub struct ServerStateMap(pub HashMap<String, String>);

/// Packet entry: per-server health.
pub struct ServerHealthMap(pub HashMap<String, ServerHealth>);

/// Packet entry: servers whose health could not be read this tick.
pub struct RemainingServersHealthToRead(pub usize);

/// Suppresses repeats of a message until the filter history is reset.
/// The status updater resets it only after a complete successful read.
#[derive(Default)]
pub struct OncePerMessageLoggingFilter {
    filtering: AtomicBool,
    history: Mutex<HashSet<String>>,
}

impl OncePerMessageLoggingFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_filtering(&self, filtering: bool) -> &Self {
        self.filtering.store(filtering, Ordering::Release);
        self
    }

    pub fn reset_log_history(&self) {
        self.history.lock().unwrap().clear();
    }

    /// Whether the message may be logged; records it either way.
    pub fn can_log(&self, message: &str) -> bool {
        let mut history = self.history.lock().unwrap();
        let first_time = history.insert(message.to_string());
        first_time || !self.filtering.load(Ordering::Acquire)
    }
}

/// Derives the textual state for one server from its pod.
fn server_state_from_pod(pod: &k8s_openapi::api::core::v1::Pod) -> &'static str {
    if is_pod_ready(pod) {
        RUNNING_STATE
    } else if pod.metadata.deletion_timestamp.is_some() {
        SHUTDOWN_STATE
    } else {
        STARTING_STATE
    }
}

/// Reads per-server state into the packet. Pod conditions are the
/// primary source; the readiness-event cache fills in servers whose pod
/// has not reported yet.
pub struct ServerStatusReaderStep;

#[async_trait]
impl Step for ServerStatusReaderStep {
    fn name(&self) -> &str {
        "ServerStatusReader"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let mut states = HashMap::new();
        let mut health = HashMap::new();
        for (server_name, pod) in info.server_pods() {
            let state = server_state_from_pod(&pod);
            states.insert(server_name.clone(), state.to_string());
            if state == RUNNING_STATE {
                health.insert(
                    server_name.clone(),
                    ServerHealth {
                        activation_time: pod
                            .status
                            .as_ref()
                            .and_then(|s| s.start_time.as_ref())
                            .map(|t| t.0.to_rfc3339()),
                        overall_health: Some("ok".to_string()),
                        subsystems: Vec::new(),
                    },
                );
            } else if let Some(status) = info.last_known_server_status(&server_name) {
                states.insert(server_name.clone(), status);
            }
        }
        let unread = states.len() - health.len();
        packet.insert(ServerStateMap(states));
        packet.insert(ServerHealthMap(health));
        packet.insert(RemainingServersHealthToRead(unread));
        Ok(NextAction::Continue)
    }
}

/// Assembles the domain status from the packet maps and writes it back
/// when it differs from the last observed one. The write is bounded by
/// the status-update timeout.
pub struct StatusUpdateStep {
    facade: Arc<dyn KubernetesFacade>,
    timeout: std::time::Duration,
}

impl StatusUpdateStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>, timeout: std::time::Duration) -> Arc<Self> {
        Arc::new(Self { facade, timeout })
    }
}

#[async_trait]
impl Step for StatusUpdateStep {
    fn name(&self) -> &str {
        "StatusUpdate"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(mut domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };

        let mut status = domain.status.clone().unwrap_or_default();
        let topology = info.last_topology();

        status.servers = assemble_server_statuses(packet, topology.as_ref());
        status.clusters = domain
            .spec
            .clusters
            .iter()
            .map(|cluster_spec| {
                let topology_cluster =
                    topology.as_ref().and_then(|t| t.cluster(&cluster_spec.cluster_name));
                let ready = status
                    .servers
                    .iter()
                    .filter(|s| {
                        s.cluster_name.as_deref() == Some(cluster_spec.cluster_name.as_str())
                            && s.state.as_deref() == Some(RUNNING_STATE)
                    })
                    .count() as i32;
                crate::crds::ClusterStatus {
                    cluster_name: cluster_spec.cluster_name.clone(),
                    replicas: Some(policy::replica_count(&domain, &cluster_spec.cluster_name)),
                    ready_replicas: Some(ready),
                    maximum_replicas: topology_cluster.map(|c| c.maximum_size()),
                }
            })
            .collect();

        if domain.status.as_ref() != Some(&status) {
            tokio::time::timeout(
                self.timeout,
                self.facade
                    .patch_domain_status(info.namespace(), &domain.name_any(), &status),
            )
            .await
            .map_err(|_| crate::types::Error::Timeout("domain status update".to_string()))??;
            domain.status = Some(status);
            info.set_domain(domain);
            debug!(
                namespace = info.namespace(),
                domain_uid = info.domain_uid(),
                "domain status updated"
            );
        }
        Ok(NextAction::Continue)
    }
}

fn assemble_server_statuses(
    packet: &Packet,
    topology: Option<&crate::topology::WlsDomainConfig>,
) -> Vec<ServerStatus> {
    let states = packet.get::<ServerStateMap>();
    let health = packet.get::<ServerHealthMap>();
    let mut servers: Vec<ServerStatus> = states
        .map(|m| {
            m.0.iter()
                .map(|(name, state)| ServerStatus {
                    server_name: name.clone(),
                    state: Some(state.clone()),
                    cluster_name: topology
                        .and_then(|t| t.cluster_of(name))
                        .map(String::from),
                    node_name: packet
                        .info()
                        .server_pod(name)
                        .and_then(|p| p.spec.and_then(|s| s.node_name)),
                    health: health.and_then(|h| h.0.get(name).cloned()),
                })
                .collect()
        })
        .unwrap_or_default();
    servers.sort_by(|a, b| policy::natural_cmp(&a.server_name, &b.server_name));
    servers
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn set_condition(status: &mut DomainStatus, condition_type: &str, reason: Option<&str>, message: Option<&str>) {
    status.conditions.retain(|c| c.condition_type != condition_type);
    status.conditions.push(DomainCondition {
        condition_type: condition_type.to_string(),
        status: "True".to_string(),
        last_transition_time: Some(now_rfc3339()),
        reason: reason.map(String::from),
        message: message.map(String::from),
    });
}

fn clear_condition(status: &mut DomainStatus, condition_type: &str) {
    status.conditions.retain(|c| c.condition_type != condition_type);
}

/// Records a failure on the domain status. Introspection failures also
/// bump `introspectJobFailureCount`.
pub struct FailedStep {
    facade: Arc<dyn KubernetesFacade>,
    reason: String,
    message: String,
    count_introspector_failure: bool,
}

impl FailedStep {
    pub fn new(
        facade: Arc<dyn KubernetesFacade>,
        reason: &str,
        message: &str,
        count_introspector_failure: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            facade,
            reason: reason.to_string(),
            message: message.to_string(),
            count_introspector_failure,
        })
    }
}

#[async_trait]
impl Step for FailedStep {
    fn name(&self) -> &str {
        "DomainStatusFailed"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(mut domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let mut status = domain.status.clone().unwrap_or_default();
        status.reason = Some(self.reason.clone());
        status.message = Some(self.message.clone());
        if self.count_introspector_failure {
            status.introspect_job_failure_count += 1;
        }
        set_condition(&mut status, "Failed", Some(&self.reason), Some(&self.message));
        clear_condition(&mut status, "Progressing");

        self.facade
            .patch_domain_status(info.namespace(), &domain.name_any(), &status)
            .await?;
        domain.status = Some(status);
        info.set_domain(domain);
        info!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            reason = %self.reason,
            "domain status marked failed"
        );
        Ok(NextAction::Continue)
    }
}

/// Marks the domain as progressing (e.g. introspection under way).
pub struct ProgressingStep {
    facade: Arc<dyn KubernetesFacade>,
    reason: String,
}

impl ProgressingStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>, reason: &str) -> Arc<Self> {
        Arc::new(Self {
            facade,
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl Step for ProgressingStep {
    fn name(&self) -> &str {
        "DomainStatusProgressing"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(mut domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let mut status = domain.status.clone().unwrap_or_default();
        set_condition(&mut status, "Progressing", Some(&self.reason), None);
        clear_condition(&mut status, "Failed");
        self.facade
            .patch_domain_status(info.namespace(), &domain.name_any(), &status)
            .await?;
        domain.status = Some(status);
        info.set_domain(domain);
        Ok(NextAction::Continue)
    }
}

/// Closes out the progressing condition once the plan brought every
/// expected server up; the domain becomes available.
pub struct EndProgressingStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl EndProgressingStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for EndProgressingStep {
    fn name(&self) -> &str {
        "DomainStatusEndProgressing"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(mut domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let mut status = domain.status.clone().unwrap_or_default();
        clear_condition(&mut status, "Progressing");
        clear_condition(&mut status, "Failed");
        set_condition(&mut status, "Available", Some("ServersReady"), None);
        status.reason = None;
        status.message = None;
        status.introspect_job_failure_count = 0;
        self.facade
            .patch_domain_status(info.namespace(), &domain.name_any(), &status)
            .await?;
        domain.status = Some(status);
        info.set_domain(domain);
        Ok(NextAction::Continue)
    }
}

/// Registry of the periodic per-domain status tasks. Replacing an entry
/// cancels the previous task; both operations are atomic under one lock.
#[derive(Default)]
pub struct StatusUpdaters {
    tasks: Mutex<HashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl StatusUpdaters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, namespace: &str, domain_uid: &str, task: tokio::task::JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(previous) =
            tasks.insert((namespace.to_string(), domain_uid.to_string()), task)
        {
            previous.abort();
        }
    }

    pub fn unregister(&self, namespace: &str, domain_uid: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.remove(&(namespace.to_string(), domain_uid.to_string())) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_suppresses_repeats_until_reset() {
        let filter = OncePerMessageLoggingFilter::new();
        filter.set_filtering(true);
        assert!(filter.can_log("connect refused"));
        assert!(!filter.can_log("connect refused"));
        assert!(filter.can_log("other"));

        filter.set_filtering(false).reset_log_history();
        assert!(filter.can_log("connect refused"));
        assert!(filter.can_log("connect refused"));
    }

    #[test]
    fn conditions_replace_their_own_type() {
        let mut status = DomainStatus::default();
        set_condition(&mut status, "Progressing", Some("Introspecting"), None);
        set_condition(&mut status, "Progressing", Some("ServersStarting"), None);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason.as_deref(), Some("ServersStarting"));
        clear_condition(&mut status, "Progressing");
        assert!(status.conditions.is_empty());
    }
}
