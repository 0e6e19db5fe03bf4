//! Label constants and resource naming rules shared by the engine.

pub const DOMAINUID_LABEL: &str = "weblogic.domainUID";
pub const SERVERNAME_LABEL: &str = "weblogic.serverName";
pub const JOBNAME_LABEL: &str = "weblogic.jobName";
pub const CLUSTERNAME_LABEL: &str = "weblogic.clusterName";
pub const CREATEDBYOPERATOR_LABEL: &str = "weblogic.createdByOperator";
pub const INTROSPECTION_STATE_LABEL: &str = "weblogic.introspectVersion";

/// Annotation carrying the hash of the generated pod spec.
pub const SHA256_ANNOTATION: &str = "weblogic.sha256";

pub const READINESS_PROBE_NOT_READY_TOKEN: &str = "Readiness probe failed";

const MAX_DNS_LABEL_LENGTH: usize = 63;

/// Converts a WebLogic name to a DNS-1123 legal name.
pub fn to_dns1123_legal_name(value: &str) -> String {
    let legal = value.to_lowercase().replace('_', "-");
    legal.chars().take(MAX_DNS_LABEL_LENGTH).collect()
}

/// Name of the introspector job (and its pod prefix) for a domain.
pub fn to_job_introspector_name(domain_uid: &str) -> String {
    to_dns1123_legal_name(&format!("{domain_uid}-introspector"))
}

/// Name of the ConfigMap holding the introspection output.
pub fn to_introspector_config_map_name(domain_uid: &str) -> String {
    to_dns1123_legal_name(&format!("{domain_uid}-weblogic-domain-introspect-cm"))
}

/// Name of the pod running the given server.
pub fn to_server_pod_name(domain_uid: &str, server_name: &str) -> String {
    to_dns1123_legal_name(&format!("{domain_uid}-{server_name}"))
}

/// Name of the per-server (internal) service.
pub fn to_server_service_name(domain_uid: &str, server_name: &str) -> String {
    to_dns1123_legal_name(&format!("{domain_uid}-{server_name}"))
}

/// Name of the external admin service, when one is configured.
pub fn to_external_service_name(domain_uid: &str, server_name: &str) -> String {
    to_dns1123_legal_name(&format!("{domain_uid}-{server_name}-external"))
}

/// Selector matching every resource the operator created for a domain.
pub fn operator_managed_selector(domain_uid: &str) -> String {
    format!("{DOMAINUID_LABEL}={domain_uid},{CREATEDBYOPERATOR_LABEL}=true")
}
