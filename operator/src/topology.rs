//! WebLogic domain topology as reported by the introspector in
//! `topology.yaml`.

use crate::types::Result;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct WlsServerConfig {
    pub name: String,

    #[serde(default, rename = "listenPort", skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<i32>,
}

/// Settings of a dynamic cluster: servers are generated from a prefix.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct WlsDynamicServersConfig {
    #[serde(rename = "serverNamePrefix")]
    pub server_name_prefix: String,

    #[serde(rename = "dynamicClusterSize")]
    pub dynamic_cluster_size: i32,

    #[serde(rename = "maxDynamicClusterSize")]
    pub max_dynamic_cluster_size: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct WlsClusterConfig {
    pub name: String,

    #[serde(default)]
    pub servers: Vec<WlsServerConfig>,

    #[serde(
        default,
        rename = "dynamicServersConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub dynamic_servers: Option<WlsDynamicServersConfig>,
}

impl WlsClusterConfig {
    pub fn is_dynamic(&self) -> bool {
        self.dynamic_servers.is_some()
    }

    /// Member names in declaration order. Dynamic clusters enumerate
    /// `<prefix><i>` for i in 1..=dynamicClusterSize.
    pub fn server_names(&self) -> Vec<String> {
        match &self.dynamic_servers {
            Some(dynamic) => (1..=dynamic.dynamic_cluster_size)
                .map(|i| format!("{}{}", dynamic.server_name_prefix, i))
                .collect(),
            None => self.servers.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Upper bound on cluster membership.
    pub fn maximum_size(&self) -> i32 {
        match &self.dynamic_servers {
            Some(dynamic) => dynamic.max_dynamic_cluster_size,
            None => self.servers.len() as i32,
        }
    }
}

/// Parsed `topology.yaml`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct WlsDomainConfig {
    pub name: String,

    #[serde(rename = "adminServerName")]
    pub admin_server_name: String,

    #[serde(default, rename = "configuredClusters")]
    pub clusters: Vec<WlsClusterConfig>,

    #[serde(default)]
    pub servers: Vec<WlsServerConfig>,
}

impl WlsDomainConfig {
    pub fn cluster(&self, name: &str) -> Option<&WlsClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Non-clustered managed servers, i.e. everything in `servers`
    /// except the administration server.
    pub fn standalone_servers(&self) -> Vec<&WlsServerConfig> {
        self.servers
            .iter()
            .filter(|s| s.name != self.admin_server_name)
            .collect()
    }

    /// The cluster a managed server belongs to, if any.
    pub fn cluster_of(&self, server_name: &str) -> Option<&str> {
        self.clusters
            .iter()
            .find(|c| c.server_names().iter().any(|n| n == server_name))
            .map(|c| c.name.as_str())
    }
}

#[derive(Deserialize)]
struct TopologyFile {
    domain: WlsDomainConfig,
}

/// Parses the `topology.yaml` payload of the introspection ConfigMap.
pub fn parse_topology_yaml(yaml: &str) -> Result<WlsDomainConfig> {
    let file: TopologyFile = serde_yaml::from_str(yaml)?;
    Ok(file.domain)
}
