//! Bring-up and scale-down of managed servers, driven by the policy
//! evaluator's started set.

use crate::kubernetes::KubernetesFacade;
use crate::labels::{to_server_pod_name, to_server_service_name};
use crate::policy;
use crate::steps::introspection::DomainTopology;
use crate::steps::resources;
use crate::types::{Error, Result};
use crate::work::{NextAction, Packet, Step, StepRef};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Computes the set of managed servers that must run and splices one
/// bring-up step per started server plus one shutdown step per pod that
/// is no longer wanted.
pub struct ManagedServersUpStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl ManagedServersUpStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for ManagedServersUpStep {
    fn name(&self) -> &str {
        "ManagedServersUp"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let topology = packet
            .get::<DomainTopology>()
            .map(|t| t.0.clone())
            .or_else(|| info.last_topology())
            .ok_or_else(|| {
                Error::Introspection("managed server bring-up requires a topology".to_string())
            })?;

        let mut steps: Vec<StepRef> = Vec::new();
        let mut started: HashSet<String> = HashSet::new();

        for cluster in &topology.clusters {
            for server_name in policy::started_servers(&domain, cluster) {
                let port = cluster
                    .servers
                    .iter()
                    .find(|s| s.name == server_name)
                    .and_then(|s| s.listen_port);
                started.insert(server_name.clone());
                steps.push(Arc::new(ServerUpStep {
                    facade: self.facade.clone(),
                    server_name,
                    cluster_name: Some(cluster.name.clone()),
                    listen_port: port,
                }));
            }
        }

        for server in topology.standalone_servers() {
            if policy::standalone_server_should_run(&domain, &server.name) {
                started.insert(server.name.clone());
                steps.push(Arc::new(ServerUpStep {
                    facade: self.facade.clone(),
                    server_name: server.name.clone(),
                    cluster_name: None,
                    listen_port: server.listen_port,
                }));
            }
        }

        // Anything we run that is no longer wanted gets shut down.
        for server_name in info.server_pods().into_keys() {
            if server_name != topology.admin_server_name && !started.contains(&server_name) {
                steps.push(Arc::new(ServerDownStep {
                    facade: self.facade.clone(),
                    server_name,
                }));
            }
        }

        debug!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            started = started.len(),
            "managed server plan computed"
        );
        Ok(NextAction::Invoke(steps))
    }
}

struct ServerUpStep {
    facade: Arc<dyn KubernetesFacade>,
    server_name: String,
    cluster_name: Option<String>,
    listen_port: Option<i32>,
}

#[async_trait]
impl Step for ServerUpStep {
    fn name(&self) -> &str {
        "ServerUp"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let desired = resources::server_pod(
            &domain,
            &self.server_name,
            self.cluster_name.as_deref(),
            self.listen_port,
        );
        resources::ensure_server_pod(self.facade.as_ref(), &info, desired, &self.server_name)
            .await?;
        let service = resources::server_service(&domain, &self.server_name, self.listen_port);
        resources::ensure_service(self.facade.as_ref(), &info, service).await?;
        Ok(NextAction::Continue)
    }
}

struct ServerDownStep {
    facade: Arc<dyn KubernetesFacade>,
    server_name: String,
}

#[async_trait]
impl Step for ServerDownStep {
    fn name(&self) -> &str {
        "ServerDown"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let namespace = info.namespace();
        let domain_uid = info.domain_uid();
        info!(
            namespace,
            domain_uid,
            server = %self.server_name,
            "shutting down managed server"
        );
        info.set_server_pod_being_deleted(&self.server_name, true);
        self.facade
            .delete_pod(namespace, &to_server_pod_name(domain_uid, &self.server_name))
            .await?;
        info.remove_server_pod(&self.server_name);
        let service_name = to_server_service_name(domain_uid, &self.server_name);
        self.facade.delete_service(namespace, &service_name).await?;
        Ok(NextAction::Continue)
    }
}
