//! Bring-up of the administration server: pod, services, readiness.

use crate::kubernetes::{is_pod_ready, KubernetesFacade};
use crate::labels::{to_external_service_name, to_server_pod_name};
use crate::policy::admin_server_should_run;
use crate::steps::introspection::DomainTopology;
use crate::steps::resources;
use crate::types::{Error, Result};
use crate::work::{NextAction, Packet, Step};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Packet entry: the administration server name from the topology.
pub struct AdminServerName(pub String);

/// Packet entry: the administration server's listen port, when known.
pub struct AdminServerPort(pub Option<i32>);

/// Resolves the admin server identity before any admin resource step.
pub struct BeforeAdminServiceStep;

#[async_trait]
impl Step for BeforeAdminServiceStep {
    fn name(&self) -> &str {
        "BeforeAdminService"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let topology = packet
            .get::<DomainTopology>()
            .map(|t| t.0.clone())
            .or_else(|| packet.info().last_topology())
            .ok_or_else(|| {
                Error::Introspection("admin server bring-up requires a topology".to_string())
            })?;
        let port = topology
            .servers
            .iter()
            .find(|s| s.name == topology.admin_server_name)
            .and_then(|s| s.listen_port);
        packet.insert(AdminServerName(topology.admin_server_name.clone()));
        packet.insert(AdminServerPort(port));
        Ok(NextAction::Continue)
    }
}

/// Creates or recycles the admin server pod. When the domain policy is
/// `NEVER`, an existing admin pod is deleted instead.
pub struct CreateAdminPodStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl CreateAdminPodStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for CreateAdminPodStep {
    fn name(&self) -> &str {
        "CreateAdminPod"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        let admin_name = packet
            .get::<AdminServerName>()
            .map(|n| n.0.clone())
            .ok_or_else(|| Error::Internal("admin server name not resolved".to_string()))?;
        let port = packet.get::<AdminServerPort>().and_then(|p| p.0);

        if !admin_server_should_run(&domain) {
            if info.server_pod(&admin_name).is_some() {
                info.set_server_pod_being_deleted(&admin_name, true);
                self.facade
                    .delete_pod(
                        info.namespace(),
                        &to_server_pod_name(info.domain_uid(), &admin_name),
                    )
                    .await?;
                info.remove_server_pod(&admin_name);
            }
            return Ok(NextAction::Continue);
        }

        let desired = resources::server_pod(&domain, &admin_name, None, port);
        resources::ensure_server_pod(self.facade.as_ref(), &info, desired, &admin_name).await?;
        Ok(NextAction::Continue)
    }
}

/// Creates the external NodePort admin service when channels are
/// configured.
pub struct CreateExternalAdminServiceStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl CreateExternalAdminServiceStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for CreateExternalAdminServiceStep {
    fn name(&self) -> &str {
        "CreateExternalAdminService"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        if !admin_server_should_run(&domain) || !domain.is_external_service_configured() {
            return Ok(NextAction::Continue);
        }
        let admin_name = packet
            .get::<AdminServerName>()
            .map(|n| n.0.clone())
            .ok_or_else(|| Error::Internal("admin server name not resolved".to_string()))?;
        let channels = domain
            .spec
            .admin_server
            .as_ref()
            .and_then(|a| a.admin_service.as_ref())
            .map(|s| s.channels.clone())
            .unwrap_or_default();

        let desired = resources::external_admin_service(&domain, &admin_name, &channels);
        let name = to_external_service_name(info.domain_uid(), &admin_name);
        if self.facade.get_service(info.namespace(), &name).await?.is_none() {
            let created = self.facade.create_service(info.namespace(), &desired).await?;
            info.set_service_from_event(&name, created);
        }
        Ok(NextAction::Continue)
    }
}

/// Creates the internal per-server service for the admin server.
pub struct CreateAdminServiceStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl CreateAdminServiceStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for CreateAdminServiceStep {
    fn name(&self) -> &str {
        "CreateAdminService"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        if !admin_server_should_run(&domain) {
            return Ok(NextAction::Continue);
        }
        let admin_name = packet
            .get::<AdminServerName>()
            .map(|n| n.0.clone())
            .ok_or_else(|| Error::Internal("admin server name not resolved".to_string()))?;
        let port = packet.get::<AdminServerPort>().and_then(|p| p.0);
        let desired = resources::server_service(&domain, &admin_name, port);
        resources::ensure_service(self.facade.as_ref(), &info, desired).await?;
        Ok(NextAction::Continue)
    }
}

/// Suspends the fiber until the admin server pod reports ready.
pub struct WatchPodReadyAdminStep {
    facade: Arc<dyn KubernetesFacade>,
    timeout: Duration,
}

impl WatchPodReadyAdminStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self { facade, timeout })
    }
}

#[async_trait]
impl Step for WatchPodReadyAdminStep {
    fn name(&self) -> &str {
        "WatchPodReadyAdmin"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };
        if !admin_server_should_run(&domain) {
            return Ok(NextAction::Continue);
        }
        let admin_name = packet
            .get::<AdminServerName>()
            .map(|n| n.0.clone())
            .ok_or_else(|| Error::Internal("admin server name not resolved".to_string()))?;

        if info.server_pod(&admin_name).map(|p| is_pod_ready(&p)).unwrap_or(false) {
            return Ok(NextAction::Continue);
        }

        debug!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            server = %admin_name,
            "waiting for admin server pod to become ready"
        );
        let facade = self.facade.clone();
        let namespace = info.namespace().to_string();
        let pod_name = to_server_pod_name(info.domain_uid(), &admin_name);
        let timeout = self.timeout;
        Ok(NextAction::Suspend(Box::pin(async move {
            facade.wait_for_pod_ready(&namespace, &pod_name, timeout).await
        })))
    }
}
