//! Steps that bracket every make-right plan: registration, presence
//! seeding, head/tail bookkeeping, and the up-path branch decision.

use crate::crds::Domain;
use crate::kubernetes::{is_pod_ready, pod_label, KubernetesFacade};
use crate::labels::{operator_managed_selector, SERVERNAME_LABEL};
use crate::presence::{DomainPresenceCache, DomainPresenceInfo};
use crate::status::{ServerHealthMap, ServerStateMap, StatusUpdaters};
use crate::steps::introspection::{DomainIntrospectRequested, DomainTopology, IntrospectionStateLabel};
use crate::steps::resources;
use crate::types::Result;
use crate::work::{NextAction, Packet, Step, StepRef};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Rejects domains whose spec is malformed before any plan work runs.
pub struct DomainValidationStep;

#[async_trait]
impl Step for DomainValidationStep {
    fn name(&self) -> &str {
        "DomainValidation"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        if let Some(domain) = packet.info().domain() {
            crate::policy::validate_domain_spec(&domain)?;
        }
        Ok(NextAction::Continue)
    }
}

/// Seeds the per-server state maps from the last observed domain status.
pub struct PopulatePacketServerMapsStep;

#[async_trait]
impl Step for PopulatePacketServerMapsStep {
    fn name(&self) -> &str {
        "PopulatePacketServerMaps"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let mut states = HashMap::new();
        let mut health = HashMap::new();
        if let Some(status) = packet.info().domain().and_then(|d| d.status) {
            for server in status.servers {
                if let Some(state) = server.state {
                    states.insert(server.server_name.clone(), state);
                }
                if let Some(server_health) = server.health {
                    health.insert(server.server_name.clone(), server_health);
                }
            }
        }
        if !states.is_empty() {
            packet.insert(ServerStateMap(states));
        }
        if !health.is_empty() {
            packet.insert(ServerHealthMap(health));
        }
        Ok(NextAction::Continue)
    }
}

/// Registers the presence info and, when the maps were never seeded,
/// lists the domain's existing pods and services before anything may be
/// created or deleted.
pub struct StartPlanStep {
    cache: Arc<DomainPresenceCache>,
    facade: Arc<dyn KubernetesFacade>,
}

impl StartPlanStep {
    pub fn new(cache: Arc<DomainPresenceCache>, facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { cache, facade })
    }
}

#[async_trait]
impl Step for StartPlanStep {
    fn name(&self) -> &str {
        "StartPlan"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        self.cache.register(info.clone());
        if !info.is_populated() && info.is_not_deleting() {
            return Ok(NextAction::Invoke(vec![Arc::new(
                RecordExistingResourcesStep {
                    facade: self.facade.clone(),
                },
            )]));
        }
        Ok(NextAction::Continue)
    }
}

struct RecordExistingResourcesStep {
    facade: Arc<dyn KubernetesFacade>,
}

#[async_trait]
impl Step for RecordExistingResourcesStep {
    fn name(&self) -> &str {
        "RecordExistingResources"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let selector = operator_managed_selector(info.domain_uid());

        for pod in self.facade.list_pods(info.namespace(), &selector).await? {
            if let Some(server) = pod_label(&pod, SERVERNAME_LABEL) {
                let server = server.to_string();
                info.set_server_pod(&server, pod);
            }
        }
        for service in self.facade.list_services(info.namespace(), &selector).await? {
            let name = service.name_any();
            info.set_service_from_event(&name, service);
        }
        info.set_populated(true);
        debug!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            "seeded presence maps from list"
        );
        Ok(NextAction::Continue)
    }
}

/// First step of the up-plan: the domain is no longer being deleted.
pub struct UpHeadStep;

#[async_trait]
impl Step for UpHeadStep {
    fn name(&self) -> &str {
        "UpHead"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        packet.info().set_deleting(false);
        Ok(NextAction::Continue)
    }
}

/// First step of the down-plan: marks the domain deleting and stops its
/// status updater.
pub struct DownHeadStep {
    updaters: Arc<StatusUpdaters>,
}

impl DownHeadStep {
    pub fn new(updaters: Arc<StatusUpdaters>) -> Arc<Self> {
        Arc::new(Self { updaters })
    }
}

#[async_trait]
impl Step for DownHeadStep {
    fn name(&self) -> &str {
        "DownHead"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info();
        info.set_deleting(true);
        self.updaters.unregister(info.namespace(), info.domain_uid());
        Ok(NextAction::Continue)
    }
}

/// Last step of a successful up-plan.
pub struct TailStep;

#[async_trait]
impl Step for TailStep {
    fn name(&self) -> &str {
        "Tail"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        packet.info().complete();
        Ok(NextAction::Continue)
    }
}

/// Last step of a successful down-plan: the domain is forgotten. Pod
/// events arriving afterwards find no presence info and cannot revive it.
pub struct UnregisterStep {
    cache: Arc<DomainPresenceCache>,
}

impl UnregisterStep {
    pub fn new(cache: Arc<DomainPresenceCache>) -> Arc<Self> {
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl Step for UnregisterStep {
    fn name(&self) -> &str {
        "Unregister"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info();
        self.cache.unregister(info.namespace(), info.domain_uid());
        Ok(NextAction::Continue)
    }
}

/// Chooses between the full domain-up strategy (introspection, admin
/// server, managed servers) and the managed-servers-only strategy when
/// the introspection output is still valid and the admin server is
/// already running the computed spec.
pub struct DomainPresenceStep {
    domain_up: Vec<StepRef>,
    managed_only: Vec<StepRef>,
}

impl DomainPresenceStep {
    pub fn new(domain_up: Vec<StepRef>, managed_only: Vec<StepRef>) -> Arc<Self> {
        Arc::new(Self {
            domain_up,
            managed_only,
        })
    }

    fn needs_full_up(packet: &Packet) -> bool {
        let info = packet.info();
        let Some(domain) = info.domain() else {
            return true;
        };
        let Some(DomainTopology(topology)) = packet.get::<DomainTopology>() else {
            return true;
        };
        if packet.contains::<DomainIntrospectRequested>() {
            return true;
        }
        let requested = domain.introspect_version().unwrap_or("0");
        let recorded = packet
            .get::<IntrospectionStateLabel>()
            .map(|l| l.0.as_str())
            .unwrap_or("0");
        if requested != recorded {
            return true;
        }
        let admin_port = topology
            .servers
            .iter()
            .find(|s| s.name == topology.admin_server_name)
            .and_then(|s| s.listen_port);
        !admin_server_matches(&domain, info, &topology.admin_server_name, admin_port)
    }
}

fn admin_server_matches(
    domain: &Domain,
    info: &DomainPresenceInfo,
    admin_name: &str,
    admin_port: Option<i32>,
) -> bool {
    let Some(pod) = info.server_pod(admin_name) else {
        return false;
    };
    if !is_pod_ready(&pod) {
        return false;
    }
    let desired = resources::server_pod(domain, admin_name, None, admin_port);
    let annotation = |p: &k8s_openapi::api::core::v1::Pod| {
        p.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::labels::SHA256_ANNOTATION))
            .cloned()
    };
    annotation(&desired) == annotation(&pod)
}

#[async_trait]
impl Step for DomainPresenceStep {
    fn name(&self) -> &str {
        "DomainPresence"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        if Self::needs_full_up(packet) {
            Ok(NextAction::Divert(self.domain_up.clone()))
        } else {
            debug!(
                domain_uid = packet.info().domain_uid(),
                "introspection current and admin server in place, refreshing managed servers only"
            );
            Ok(NextAction::Divert(self.managed_only.clone()))
        }
    }
}
