//! `Domain` Custom Resource Definition for WebLogic domains.

use k8s_openapi::api::core::v1::{EnvVar, LocalObjectReference, SecretReference};
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server state reported in `status.servers[].state`.
pub const RUNNING_STATE: &str = "RUNNING";
pub const STARTING_STATE: &str = "STARTING";
pub const SHUTDOWN_STATE: &str = "SHUTDOWN";

/// Token marking an unrecoverable Model-in-Image introspection failure.
pub const FATAL_INTROSPECTOR_ERROR: &str = "FatalIntrospectorError";

/// Where the domain home comes from.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DomainSourceType {
    #[default]
    Image,
    FromModel,
    PersistentVolume,
}

/// Declarative intent for whether a server (or set of servers) runs.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ServerStartPolicy {
    #[serde(rename = "NEVER")]
    Never,
    #[serde(rename = "IF_NEEDED")]
    IfNeeded,
    #[serde(rename = "ADMIN_ONLY")]
    AdminOnly,
    #[serde(rename = "ALWAYS")]
    Always,
}

fn default_include_server_out() -> bool {
    true
}

/// Graceful-shutdown options applied when a server pod is stopped.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Shutdown {
    /// "Graceful" or "Forced"
    #[serde(default, rename = "shutdownType", skip_serializing_if = "Option::is_none")]
    pub shutdown_type: Option<String>,

    #[serde(default, rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,

    #[serde(default, rename = "ignoreSessions", skip_serializing_if = "Option::is_none")]
    pub ignore_sessions: Option<bool>,
}

/// Customizations applied to the pod generated for a server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerPod {
    /// Environment variables added to the WebLogic server container
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Extra labels placed on the generated pod
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations placed on the generated pod
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<Shutdown>,
}

/// A network channel exposed through the external admin service.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Channel {
    #[serde(rename = "channelName")]
    pub channel_name: String,

    #[serde(default, rename = "nodePort", skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// NodePort service configuration for the administration server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AdminService {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// Configuration specific to the administration server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AdminServer {
    #[serde(default, rename = "serverStartState", skip_serializing_if = "Option::is_none")]
    pub server_start_state: Option<String>,

    #[serde(default, rename = "serverStartPolicy", skip_serializing_if = "Option::is_none")]
    pub server_start_policy: Option<ServerStartPolicy>,

    #[serde(default, rename = "serverPod", skip_serializing_if = "Option::is_none")]
    pub server_pod: Option<ServerPod>,

    #[serde(default, rename = "adminService", skip_serializing_if = "Option::is_none")]
    pub admin_service: Option<AdminService>,
}

/// Per-cluster overrides.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterSpec {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Desired number of running managed servers in this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, rename = "serverStartPolicy", skip_serializing_if = "Option::is_none")]
    pub server_start_policy: Option<ServerStartPolicy>,

    #[serde(default, rename = "serverStartState", skip_serializing_if = "Option::is_none")]
    pub server_start_state: Option<String>,

    #[serde(default, rename = "serverPod", skip_serializing_if = "Option::is_none")]
    pub server_pod: Option<ServerPod>,

    #[serde(default, rename = "restartVersion", skip_serializing_if = "Option::is_none")]
    pub restart_version: Option<String>,
}

/// Per-server overrides.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManagedServerSpec {
    #[serde(rename = "serverName")]
    pub server_name: String,

    #[serde(default, rename = "serverStartPolicy", skip_serializing_if = "Option::is_none")]
    pub server_start_policy: Option<ServerStartPolicy>,

    #[serde(default, rename = "serverStartState", skip_serializing_if = "Option::is_none")]
    pub server_start_state: Option<String>,

    #[serde(default, rename = "serverPod", skip_serializing_if = "Option::is_none")]
    pub server_pod: Option<ServerPod>,

    #[serde(default, rename = "restartVersion", skip_serializing_if = "Option::is_none")]
    pub restart_version: Option<String>,
}

/// Online-update switch for Model-in-Image domains.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OnlineUpdate {
    #[serde(default)]
    pub enabled: bool,
}

/// Model-in-Image configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ModelConfiguration {
    #[serde(default, rename = "domainType", skip_serializing_if = "Option::is_none")]
    pub domain_type: Option<String>,

    #[serde(
        default,
        rename = "runtimeEncryptionSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_encryption_secret: Option<String>,

    #[serde(default, rename = "onlineUpdate", skip_serializing_if = "Option::is_none")]
    pub online_update: Option<OnlineUpdate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfiguration>,
}

/// `Domain` CRD describing one WebLogic domain and how to run it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "weblogic.oracle", version = "v8", kind = "Domain")]
#[kube(namespaced)]
#[kube(status = "DomainStatus")]
#[kube(printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.domainHomeSourceType"}"#)]
#[kube(printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#)]
#[kube(printcolumn = r#"{"name":"Failures","type":"integer","jsonPath":".status.introspectJobFailureCount"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct DomainSpec {
    /// Unique identifier of the domain; defaults to the resource name
    #[serde(default, rename = "domainUID", skip_serializing_if = "Option::is_none")]
    pub domain_uid: Option<String>,

    #[serde(default, rename = "domainHomeSourceType")]
    pub domain_home_source_type: DomainSourceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, rename = "imagePullSecrets")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    #[serde(
        default,
        rename = "webLogicCredentialsSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub web_logic_credentials_secret: Option<SecretReference>,

    /// Whether server stdout is copied into the pod log
    #[serde(default = "default_include_server_out", rename = "includeServerOutInPodLog")]
    pub include_server_out_in_pod_log: bool,

    #[serde(default, rename = "serverStartPolicy", skip_serializing_if = "Option::is_none")]
    pub server_start_policy: Option<ServerStartPolicy>,

    /// Default replica count for clusters that do not declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, rename = "restartVersion", skip_serializing_if = "Option::is_none")]
    pub restart_version: Option<String>,

    #[serde(default, rename = "introspectVersion", skip_serializing_if = "Option::is_none")]
    pub introspect_version: Option<String>,

    #[serde(default, rename = "serverPod", skip_serializing_if = "Option::is_none")]
    pub server_pod: Option<ServerPod>,

    #[serde(default, rename = "adminServer", skip_serializing_if = "Option::is_none")]
    pub admin_server: Option<AdminServer>,

    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,

    #[serde(default, rename = "managedServers")]
    pub managed_servers: Vec<ManagedServerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
}

impl DomainSpec {
    pub fn cluster(&self, cluster_name: &str) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| c.cluster_name == cluster_name)
    }

    pub fn managed_server(&self, server_name: &str) -> Option<&ManagedServerSpec> {
        self.managed_servers
            .iter()
            .find(|s| s.server_name == server_name)
    }

    pub fn online_update_enabled(&self) -> bool {
        self.configuration
            .as_ref()
            .and_then(|c| c.model.as_ref())
            .and_then(|m| m.online_update.as_ref())
            .map(|o| o.enabled)
            .unwrap_or(false)
    }

    /// True when the only differences from `other` are `introspectVersion`
    /// and the online-update switch itself. Anything beyond that whitelist
    /// makes the change incompatible with an online update.
    pub fn is_spec_change_for_online_update_only(&self, other: &DomainSpec) -> bool {
        normalize_for_online_update(self) == normalize_for_online_update(other)
    }
}

fn normalize_for_online_update(spec: &DomainSpec) -> DomainSpec {
    let mut normalized = spec.clone();
    normalized.introspect_version = None;
    if let Some(model) = normalized
        .configuration
        .as_mut()
        .and_then(|c| c.model.as_mut())
    {
        model.online_update = None;
    }
    normalized
}

/// Health read from a running server.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerHealth {
    #[serde(default, rename = "activationTime", skip_serializing_if = "Option::is_none")]
    pub activation_time: Option<String>,

    #[serde(default, rename = "overallHealth", skip_serializing_if = "Option::is_none")]
    pub overall_health: Option<String>,

    #[serde(default)]
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SubsystemHealth {
    #[serde(rename = "subsystemName")]
    pub subsystem_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,

    #[serde(default)]
    pub symptoms: Vec<String>,
}

/// Per-server entry in the domain status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerStatus {
    #[serde(rename = "serverName")]
    pub server_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, rename = "clusterName", skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, rename = "nodeName", skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<ServerHealth>,
}

/// Per-cluster entry in the domain status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterStatus {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, rename = "readyReplicas", skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    #[serde(default, rename = "maximumReplicas", skip_serializing_if = "Option::is_none")]
    pub maximum_replicas: Option<i32>,
}

/// Condition on the `Domain` (Progressing, Available, Failed).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DomainCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: String,

    #[serde(
        default,
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state of the `Domain`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DomainStatus {
    #[serde(default)]
    pub servers: Vec<ServerStatus>,

    #[serde(default)]
    pub clusters: Vec<ClusterStatus>,

    #[serde(default)]
    pub conditions: Vec<DomainCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, rename = "introspectJobFailureCount")]
    pub introspect_job_failure_count: i32,

    #[serde(default, rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

impl Domain {
    /// The domain UID, falling back to the resource name.
    pub fn domain_uid(&self) -> String {
        self.spec
            .domain_uid
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    pub fn restart_version(&self) -> Option<&str> {
        self.spec.restart_version.as_deref()
    }

    pub fn introspect_version(&self) -> Option<&str> {
        self.spec.introspect_version.as_deref()
    }

    pub fn introspect_job_failure_count(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.introspect_job_failure_count)
            .unwrap_or(0)
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.message.as_deref())
    }

    /// Whether an external NodePort service should exist for the admin server.
    pub fn is_external_service_configured(&self) -> bool {
        self.spec
            .admin_server
            .as_ref()
            .and_then(|a| a.admin_service.as_ref())
            .map(|s| !s.channels.is_empty())
            .unwrap_or(false)
    }
}
