//! The introspection leg of the up-plan: decide whether a fresh
//! introspection is required, run the introspector job, and turn its log
//! into the introspection ConfigMap and an in-memory topology.

use crate::crds::FATAL_INTROSPECTOR_ERROR;
use crate::kubernetes::KubernetesFacade;
use crate::labels::{to_introspector_config_map_name, to_job_introspector_name, INTROSPECTION_STATE_LABEL};
use crate::steps::resources;
use crate::topology::{parse_topology_yaml, WlsDomainConfig};
use crate::types::{Error, Result};
use crate::work::{NextAction, Packet, Step};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Packet entry: the introspect version recorded on the existing
/// introspection ConfigMap.
pub struct IntrospectionStateLabel(pub String);

/// Packet entry: present when a fresh introspection has been requested.
pub struct DomainIntrospectRequested(pub String);

/// Packet entry: the domain topology in effect for this plan.
pub struct DomainTopology(pub WlsDomainConfig);

fn introspection_required(packet: &Packet) -> bool {
    !packet.contains::<DomainTopology>() || packet.contains::<DomainIntrospectRequested>()
}

/// Loads the existing introspection ConfigMap, if any, into the packet.
pub struct ReadExistingIntrospectorConfigMapStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl ReadExistingIntrospectorConfigMapStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for ReadExistingIntrospectorConfigMapStep {
    fn name(&self) -> &str {
        "ReadExistingIntrospectorConfigMap"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let info = packet.info().clone();
        let name = to_introspector_config_map_name(info.domain_uid());
        if let Some(config_map) = self.facade.get_config_map(info.namespace(), &name).await? {
            if let Some(version) = config_map
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(INTROSPECTION_STATE_LABEL))
            {
                packet.insert(IntrospectionStateLabel(version.clone()));
            }
            if let Some(topology_yaml) =
                config_map.data.as_ref().and_then(|d| d.get("topology.yaml"))
            {
                let topology = parse_topology_yaml(topology_yaml)?;
                info.set_last_topology(topology.clone());
                packet.insert(DomainTopology(topology));
            }
        }
        Ok(NextAction::Continue)
    }
}

/// Requests a fresh introspection when the domain's `introspectVersion`
/// differs from the one the existing ConfigMap was produced under.
pub struct IntrospectionRequestStep;

#[async_trait]
impl Step for IntrospectionRequestStep {
    fn name(&self) -> &str {
        "IntrospectionRequest"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let requested = packet
            .info()
            .domain()
            .and_then(|d| d.spec.introspect_version.clone())
            .unwrap_or_else(|| "0".to_string());
        let recorded = packet.get::<IntrospectionStateLabel>().map(|l| l.0.clone());
        if recorded.as_deref() != Some(requested.as_str()) {
            packet.insert(DomainIntrospectRequested(requested));
        }
        Ok(NextAction::Continue)
    }
}

/// Removes a stale introspector job before a new one is created.
pub struct DeleteIntrospectorJobStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl DeleteIntrospectorJobStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for DeleteIntrospectorJobStep {
    fn name(&self) -> &str {
        "DeleteIntrospectorJob"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        if introspection_required(packet) {
            let info = packet.info();
            let job_name = to_job_introspector_name(info.domain_uid());
            self.facade.delete_job(info.namespace(), &job_name).await?;
        }
        Ok(NextAction::Continue)
    }
}

/// Creates the introspector job and suspends the fiber until it
/// finishes. A failed or timed-out job surfaces as an introspection
/// error, which the retry controller counts against the domain.
pub struct CreateIntrospectorJobStep {
    facade: Arc<dyn KubernetesFacade>,
    active_deadline: Duration,
}

impl CreateIntrospectorJobStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>, active_deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            facade,
            active_deadline,
        })
    }
}

#[async_trait]
impl Step for CreateIntrospectorJobStep {
    fn name(&self) -> &str {
        "CreateIntrospectorJob"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        if !introspection_required(packet) {
            return Ok(NextAction::Continue);
        }
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };

        let job = resources::introspector_job(&domain, self.active_deadline.as_secs());
        let job_name = job.name_any();
        info!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            job = %job_name,
            "starting domain introspection"
        );
        self.facade.create_job(info.namespace(), &job).await?;

        let facade = self.facade.clone();
        let namespace = info.namespace().to_string();
        let deadline = self.active_deadline;
        Ok(NextAction::Suspend(Box::pin(async move {
            match facade
                .wait_for_job_complete(&namespace, &job_name, deadline)
                .await
            {
                Err(Error::Timeout(what)) => Err(Error::Introspection(format!(
                    "introspector did not finish in time: {what}"
                ))),
                other => other,
            }
        })))
    }
}

/// Reads the introspector pod log, writes the introspection ConfigMap,
/// and records the parsed topology.
pub struct ReadIntrospectionOutputStep {
    facade: Arc<dyn KubernetesFacade>,
}

impl ReadIntrospectionOutputStep {
    pub fn new(facade: Arc<dyn KubernetesFacade>) -> Arc<Self> {
        Arc::new(Self { facade })
    }
}

#[async_trait]
impl Step for ReadIntrospectionOutputStep {
    fn name(&self) -> &str {
        "ReadIntrospectionOutput"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        if !introspection_required(packet) {
            return Ok(NextAction::Continue);
        }
        let info = packet.info().clone();
        let Some(domain) = info.domain() else {
            return Ok(NextAction::Continue);
        };

        let job_name = to_job_introspector_name(info.domain_uid());
        let pod = self
            .facade
            .find_job_pod(info.namespace(), &job_name)
            .await?
            .ok_or_else(|| {
                Error::Introspection(format!("no pod found for introspector job {job_name}"))
            })?;
        let log = self
            .facade
            .read_pod_log(info.namespace(), &pod.name_any())
            .await?;

        if log.contains(FATAL_INTROSPECTOR_ERROR) {
            return Err(Error::FatalIntrospector(
                first_line_containing(&log, FATAL_INTROSPECTOR_ERROR),
            ));
        }

        let files = parse_introspector_log(&log);
        let topology_yaml = files.get("topology.yaml").ok_or_else(|| {
            Error::Introspection("introspector output is missing topology.yaml".to_string())
        })?;
        let topology = parse_topology_yaml(topology_yaml)?;

        let version = packet
            .remove::<DomainIntrospectRequested>()
            .map(|r| r.0)
            .unwrap_or_else(|| "0".to_string());
        let config_map = resources::introspector_config_map(&domain, files, &version);
        let cm_name = config_map.name_any();
        if self
            .facade
            .get_config_map(info.namespace(), &cm_name)
            .await?
            .is_some()
        {
            self.facade
                .patch_config_map(info.namespace(), &cm_name, &config_map)
                .await?;
        } else {
            self.facade
                .create_config_map(info.namespace(), &config_map)
                .await?;
        }

        info.set_last_topology(topology.clone());
        packet.insert(DomainTopology(topology));
        packet.insert(IntrospectionStateLabel(version));
        debug!(
            namespace = info.namespace(),
            domain_uid = info.domain_uid(),
            "introspection output recorded"
        );
        Ok(NextAction::Continue)
    }
}

/// Validates the domain spec against the freshly read topology.
pub struct AfterIntrospectValidationStep;

#[async_trait]
impl Step for AfterIntrospectValidationStep {
    fn name(&self) -> &str {
        "AfterIntrospectValidation"
    }

    async fn apply(&self, packet: &mut Packet) -> Result<NextAction> {
        let Some(domain) = packet.info().domain() else {
            return Ok(NextAction::Continue);
        };
        let Some(DomainTopology(topology)) = packet.get::<DomainTopology>() else {
            return Err(Error::Introspection(
                "no topology available after introspection".to_string(),
            ));
        };
        crate::policy::validate_domain_against_topology(&domain, topology)?;
        Ok(NextAction::Continue)
    }
}

fn first_line_containing(log: &str, token: &str) -> String {
    log.lines()
        .find(|line| line.contains(token))
        .unwrap_or(token)
        .to_string()
}

/// Splits an introspector log into its embedded files. Each file is
/// delimited by `>>>  /path/to/name` and `>>> EOF` marker lines; the key
/// is the file's base name.
pub fn parse_introspector_log(log: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in log.lines() {
        if let Some(rest) = line.strip_prefix(">>> ") {
            let marker = rest.trim();
            if marker == "EOF" {
                if let Some((name, body)) = current.take() {
                    files.insert(name, body.join("\n"));
                }
            } else if current.is_none() {
                let name = marker.rsplit('/').next().unwrap_or(marker).to_string();
                current = Some((name, Vec::new()));
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    files
}
