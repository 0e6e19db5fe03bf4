//! Routes watch events for the five resource kinds to the right
//! reaction: cache updates, make-right triggers, or status steps.

use crate::crds::Domain;
use crate::kubernetes::pod_label;
use crate::labels::{
    DOMAINUID_LABEL, JOBNAME_LABEL, READINESS_PROBE_NOT_READY_TOKEN, SERVERNAME_LABEL,
};
use crate::presence::DomainPresenceInfo;
use crate::processor::DomainProcessor;
use crate::status::{FailedStep, ProgressingStep};
use crate::steps::resources::{ScriptConfigMapStep, SCRIPT_CONFIG_MAP_NAME};
use crate::work::StepRef;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Service};
use kube::core::WatchEvent;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

impl DomainProcessor {
    /// Dispatches a Domain watch event.
    pub fn dispatch_domain_watch(self: &Arc<Self>, event: WatchEvent<Domain>) {
        match event {
            WatchEvent::Added(domain) => {
                info!(domain_uid = %domain.domain_uid(), "domain added");
                self.make_right_domain(domain)
                    .interrupt()
                    .with_explicit_recheck()
                    .execute();
            }
            WatchEvent::Modified(domain) => {
                debug!(domain_uid = %domain.domain_uid(), "domain modified");
                if self.is_metadata_only_change(&domain) {
                    // Same generation: only metadata or status moved, so
                    // refresh the cache instead of running a full plan.
                    if let Some(namespace) = domain.namespace() {
                        if let Some(cached) = self.cache().get(&namespace, &domain.domain_uid()) {
                            cached.set_domain(domain);
                        }
                    }
                    return;
                }
                self.make_right_domain(domain).execute();
            }
            WatchEvent::Deleted(domain) => {
                info!(domain_uid = %domain.domain_uid(), "domain deleted");
                self.make_right_domain(domain)
                    .interrupt()
                    .for_deletion()
                    .with_explicit_recheck()
                    .execute();
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
        }
    }

    fn is_metadata_only_change(&self, domain: &Domain) -> bool {
        let Some(namespace) = domain.namespace() else {
            return false;
        };
        let live_generation = domain.metadata.generation;
        if live_generation.is_none() {
            return false;
        }
        self.cache()
            .get(&namespace, &domain.domain_uid())
            .and_then(|info| info.domain())
            .map(|cached| cached.metadata.generation == live_generation)
            .unwrap_or(false)
    }

    /// Dispatches a Pod watch event; server pods and introspector job
    /// pods take different paths.
    pub fn dispatch_pod_watch(self: &Arc<Self>, event: WatchEvent<Pod>) {
        let pod = match &event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) | WatchEvent::Deleted(pod) => pod,
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return,
        };
        if pod_label(pod, DOMAINUID_LABEL).is_none() {
            return;
        }
        if pod_label(pod, SERVERNAME_LABEL).is_some() {
            self.process_server_pod_watch(event);
        } else if pod_label(pod, JOBNAME_LABEL).is_some() {
            self.process_introspector_job_pod_watch(event);
        }
    }

    fn process_server_pod_watch(self: &Arc<Self>, event: WatchEvent<Pod>) {
        let (pod, kind) = match event {
            WatchEvent::Added(pod) => (pod, PodEventKind::Added),
            WatchEvent::Modified(pod) => (pod, PodEventKind::Modified),
            WatchEvent::Deleted(pod) => (pod, PodEventKind::Deleted),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return,
        };
        let Some(info) = self.presence_for(&pod) else {
            return;
        };
        let Some(server_name) = pod_label(&pod, SERVERNAME_LABEL).map(String::from) else {
            return;
        };

        match kind {
            PodEventKind::Added => {
                info.set_server_pod_being_deleted(&server_name, false);
                info.set_server_pod_from_event(&server_name, pod);
            }
            PodEventKind::Modified => {
                info.set_server_pod_from_event(&server_name, pod);
            }
            PodEventKind::Deleted => {
                let removed = info.delete_server_pod_from_event(&server_name, &pod);
                if removed
                    && info.is_not_deleting()
                    && !info.is_server_pod_being_deleted(&server_name)
                {
                    info!(
                        namespace = info.namespace(),
                        domain_uid = info.domain_uid(),
                        server = %server_name,
                        "server pod deleted outside the operator, restoring"
                    );
                    self.make_right(info)
                        .interrupt()
                        .with_explicit_recheck()
                        .execute();
                }
            }
        }
    }

    fn process_introspector_job_pod_watch(self: &Arc<Self>, event: WatchEvent<Pod>) {
        let pod = match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => pod,
            _ => return,
        };
        let Some(info) = self.presence_for(&pod) else {
            return;
        };
        let facade = self.delegate().kubernetes();
        let steps: Vec<StepRef> = match classify_introspector_pod(&pod) {
            IntrospectorPodOutcome::Failed { reason, message } => {
                vec![FailedStep::new(facade, &reason, &message, false)]
            }
            IntrospectorPodOutcome::Progressing { reason } => {
                vec![ProgressingStep::new(facade, &reason)]
            }
            IntrospectorPodOutcome::None => return,
        };
        self.run_steps(info, steps);
    }

    fn presence_for(&self, pod: &Pod) -> Option<Arc<DomainPresenceInfo>> {
        let namespace = pod.namespace()?;
        let domain_uid = pod_label(pod, DOMAINUID_LABEL)?;
        self.cache().get(&namespace, domain_uid)
    }

    /// Dispatches a Service watch event.
    pub fn dispatch_service_watch(self: &Arc<Self>, event: WatchEvent<Service>) {
        let service = match &event {
            WatchEvent::Added(s) | WatchEvent::Modified(s) | WatchEvent::Deleted(s) => s,
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => return,
        };
        let Some(domain_uid) = service
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(DOMAINUID_LABEL))
        else {
            return;
        };
        let Some(namespace) = service.namespace() else {
            return;
        };
        let Some(info) = self.cache().get(&namespace, domain_uid) else {
            return;
        };
        let name = service.name_any();

        match event {
            WatchEvent::Added(service) | WatchEvent::Modified(service) => {
                info.set_service_from_event(&name, service);
            }
            WatchEvent::Deleted(service) => {
                let removed = info.delete_service_from_event(&name, &service);
                if removed && info.is_not_deleting() {
                    self.make_right(info)
                        .interrupt()
                        .with_explicit_recheck()
                        .execute();
                }
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
        }
    }

    /// Dispatches a ConfigMap watch event: the script ConfigMap is
    /// recreated whenever it is tampered with or deleted.
    pub fn dispatch_config_map_watch(self: &Arc<Self>, event: WatchEvent<ConfigMap>) {
        let config_map = match &event {
            WatchEvent::Modified(cm) | WatchEvent::Deleted(cm) => cm,
            _ => return,
        };
        if config_map.name_any() != SCRIPT_CONFIG_MAP_NAME {
            return;
        }
        let Some(namespace) = config_map.namespace() else {
            return;
        };
        debug!(namespace, "script ConfigMap changed, restoring");
        let step = ScriptConfigMapStep::new(self.delegate().kubernetes(), &namespace);
        // The script ConfigMap is namespace-scoped, not tied to one domain.
        let scope = Arc::new(DomainPresenceInfo::new(&namespace, ""));
        self.run_steps(scope, vec![step]);
    }

    /// Dispatches a core Event watch event; readiness-probe messages feed
    /// the per-server readiness cache.
    pub fn dispatch_event_watch(self: &Arc<Self>, event: WatchEvent<Event>) {
        let event = match event {
            WatchEvent::Added(e) | WatchEvent::Modified(e) => e,
            _ => return,
        };
        let Some(status) = parse_readiness_status(event.message.as_deref()) else {
            return;
        };
        let Some(namespace) = event.involved_object.namespace.as_deref() else {
            return;
        };
        let Some(object_name) = event.involved_object.name.as_deref() else {
            return;
        };
        if let Some((info, server_name)) = self.cache().find_owner(namespace, object_name) {
            info.update_last_known_server_status(&server_name, &status);
        }
    }
}

enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

enum IntrospectorPodOutcome {
    Failed { reason: String, message: String },
    Progressing { reason: String },
    None,
}

/// Inspects an introspector job pod: failed phases, containers waiting
/// with a message, error terminations and unschedulable pods become
/// domain failures; a container merely waiting while the pod succeeds is
/// progress.
fn classify_introspector_pod(pod: &Pod) -> IntrospectorPodOutcome {
    let Some(status) = pod.status.as_ref() else {
        return IntrospectorPodOutcome::None;
    };

    if status.phase.as_deref() == Some("Failed") {
        return IntrospectorPodOutcome::Failed {
            reason: status.reason.clone().unwrap_or_else(|| "PodFailed".to_string()),
            message: status.message.clone().unwrap_or_default(),
        };
    }

    if let Some(condition) = status.conditions.as_ref().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable"))
    }) {
        return IntrospectorPodOutcome::Failed {
            reason: "Unschedulable".to_string(),
            message: condition.message.clone().unwrap_or_default(),
        };
    }

    let container_state = status
        .container_statuses
        .as_ref()
        .and_then(|statuses| statuses.first())
        .and_then(|s| s.state.as_ref());
    if let Some(state) = container_state {
        if let Some(terminated) = &state.terminated {
            if terminated.exit_code != 0 {
                return IntrospectorPodOutcome::Failed {
                    reason: terminated.reason.clone().unwrap_or_else(|| "Error".to_string()),
                    message: terminated.message.clone().unwrap_or_default(),
                };
            }
        }
        if let Some(waiting) = &state.waiting {
            if let Some(message) = &waiting.message {
                return IntrospectorPodOutcome::Failed {
                    reason: waiting.reason.clone().unwrap_or_else(|| "Waiting".to_string()),
                    message: message.clone(),
                };
            }
            if let Some(reason) = &waiting.reason {
                return IntrospectorPodOutcome::Progressing {
                    reason: reason.clone(),
                };
            }
        }
    }
    IntrospectorPodOutcome::None
}

/// Extracts the server state from a readiness-probe event message, e.g.
/// `"Readiness probe failed: ... not in RUNNING state: STANDBY"`.
fn parse_readiness_status(message: Option<&str>) -> Option<String> {
    let message = message?;
    if !message.contains(READINESS_PROBE_NOT_READY_TOKEN) {
        return None;
    }
    message
        .rsplit(':')
        .next()
        .map(|state| state.trim().to_string())
        .filter(|state| !state.is_empty())
}
