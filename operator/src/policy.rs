//! Effective start policies and the started-set evaluator: which managed
//! servers must be running for a given spec, topology and replica count.

use crate::crds::{Domain, ServerStartPolicy};
use crate::topology::{WlsClusterConfig, WlsDomainConfig};
use crate::types::{Error, Result};
use std::cmp::Ordering;

/// The policy that applies to a managed server after inheritance:
/// per-server override, then cluster policy, then domain policy, then
/// `IF_NEEDED`.
pub fn effective_server_start_policy(
    domain: &Domain,
    cluster_name: Option<&str>,
    server_name: &str,
) -> ServerStartPolicy {
    if let Some(policy) = domain
        .spec
        .managed_server(server_name)
        .and_then(|s| s.server_start_policy)
    {
        return policy;
    }
    if let Some(policy) = cluster_name
        .and_then(|name| domain.spec.cluster(name))
        .and_then(|c| c.server_start_policy)
    {
        return policy;
    }
    domain
        .spec
        .server_start_policy
        .unwrap_or(ServerStartPolicy::IfNeeded)
}

/// Declared replica count for a cluster, inheriting the domain default.
pub fn replica_count(domain: &Domain, cluster_name: &str) -> i32 {
    domain
        .spec
        .cluster(cluster_name)
        .and_then(|c| c.replicas)
        .or(domain.spec.replicas)
        .unwrap_or(0)
}

/// Whether the domain-level policy allows managed servers at all.
fn managed_servers_allowed(domain: &Domain) -> bool {
    !matches!(
        domain.spec.server_start_policy,
        Some(ServerStartPolicy::Never) | Some(ServerStartPolicy::AdminOnly)
    )
}

/// Whether the administration server must run.
pub fn admin_server_should_run(domain: &Domain) -> bool {
    let policy = domain
        .spec
        .admin_server
        .as_ref()
        .and_then(|a| a.server_start_policy)
        .or(domain.spec.server_start_policy)
        .unwrap_or(ServerStartPolicy::IfNeeded);
    policy != ServerStartPolicy::Never
}

/// Numeric-aware name ordering: digit runs compare as numbers, so
/// `managed-server2` sorts before `managed-server10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) => {
                if lc.is_ascii_digit() && rc.is_ascii_digit() {
                    let lnum = take_number(&mut left);
                    let rnum = take_number(&mut right);
                    match lnum.cmp(&rnum) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    match lc.cmp(&rc) {
                        Ordering::Equal => {
                            left.next();
                            right.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value: u64 = 0;
    while let Some(c) = chars.peek().copied() {
        if let Some(digit) = c.to_digit(10) {
            value = value.saturating_mul(10).saturating_add(u64::from(digit));
            chars.next();
        } else {
            break;
        }
    }
    value
}

/// Cluster members in the evaluator's stable order: dynamic clusters as
/// generated (`<prefix>1..N`), static clusters in numeric-aware name
/// order.
fn ordered_members(cluster: &WlsClusterConfig) -> Vec<String> {
    let mut names = cluster.server_names();
    if !cluster.is_dynamic() {
        names.sort_by(|a, b| natural_cmp(a, b));
    }
    names
}

/// The servers of a cluster that must be running. `ALWAYS` servers are
/// walked first and start unconditionally; the rest start while the
/// running count stays below the replica target. `NEVER` servers never
/// start.
pub fn started_servers(domain: &Domain, cluster: &WlsClusterConfig) -> Vec<String> {
    if !managed_servers_allowed(domain) {
        return Vec::new();
    }

    let replicas = replica_count(domain, &cluster.name);
    let members = ordered_members(cluster);

    let mut always = Vec::new();
    let mut others = Vec::new();
    for name in members {
        match effective_server_start_policy(domain, Some(&cluster.name), &name) {
            ServerStartPolicy::Always => always.push(name),
            policy => others.push((name, policy)),
        }
    }

    let mut started = Vec::new();
    let mut count: i32 = 0;
    for name in always {
        started.push(name);
        count += 1;
    }
    for (name, policy) in others {
        if policy == ServerStartPolicy::Never {
            continue;
        }
        if count < replicas {
            started.push(name);
            count += 1;
        }
    }
    started
}

/// Whether a non-clustered managed server must be running.
pub fn standalone_server_should_run(domain: &Domain, server_name: &str) -> bool {
    managed_servers_allowed(domain)
        && effective_server_start_policy(domain, None, server_name) != ServerStartPolicy::Never
}

/// Whether a managed server known to the topology must be running.
pub fn should_be_running(domain: &Domain, topology: &WlsDomainConfig, server_name: &str) -> bool {
    match topology.cluster_of(server_name) {
        Some(cluster_name) => topology
            .cluster(cluster_name)
            .map(|cluster| started_servers(domain, cluster).iter().any(|s| s == server_name))
            .unwrap_or(false),
        None => standalone_server_should_run(domain, server_name),
    }
}

/// Replica count that keeps every currently started member running when
/// `server_name` is promoted to `ALWAYS`.
pub fn replica_count_preserving_promotion(
    domain: &Domain,
    cluster: &WlsClusterConfig,
    server_name: &str,
) -> i32 {
    let replicas = replica_count(domain, &cluster.name);
    if started_servers(domain, cluster).iter().any(|s| s == server_name) {
        replicas
    } else {
        replicas + 1
    }
}

/// Replica count that keeps the remaining members running when the
/// `ALWAYS` policy of `server_name` is unset.
pub fn replica_count_preserving_demotion(
    domain: &Domain,
    cluster: &WlsClusterConfig,
    server_name: &str,
) -> i32 {
    let replicas = replica_count(domain, &cluster.name);
    let was_always = effective_server_start_policy(domain, Some(&cluster.name), server_name)
        == ServerStartPolicy::Always;
    if was_always && started_servers(domain, cluster).iter().any(|s| s == server_name) {
        (replicas - 1).max(0)
    } else {
        replicas
    }
}

/// Basic spec validation that needs no topology: no duplicate cluster or
/// managed-server declarations, no negative replica counts.
pub fn validate_domain_spec(domain: &Domain) -> Result<()> {
    let mut seen_clusters = std::collections::HashSet::new();
    for cluster in &domain.spec.clusters {
        if !seen_clusters.insert(cluster.cluster_name.as_str()) {
            return Err(Error::Validation(format!(
                "cluster {} is declared more than once",
                cluster.cluster_name
            )));
        }
        if cluster.replicas.map(|r| r < 0).unwrap_or(false) {
            return Err(Error::Validation(format!(
                "cluster {} declares a negative replica count",
                cluster.cluster_name
            )));
        }
    }
    let mut seen_servers = std::collections::HashSet::new();
    for server in &domain.spec.managed_servers {
        if !seen_servers.insert(server.server_name.as_str()) {
            return Err(Error::Validation(format!(
                "managed server {} is declared more than once",
                server.server_name
            )));
        }
    }
    if domain.spec.replicas.map(|r| r < 0).unwrap_or(false) {
        return Err(Error::Validation(
            "domain declares a negative replica count".to_string(),
        ));
    }
    Ok(())
}

/// Validates the domain spec against the introspected topology: every
/// referenced cluster and managed server must exist, and dynamic-cluster
/// member numbers must stay within `maxDynamicClusterSize`.
pub fn validate_domain_against_topology(
    domain: &Domain,
    topology: &WlsDomainConfig,
) -> Result<()> {
    for cluster_spec in &domain.spec.clusters {
        if topology.cluster(&cluster_spec.cluster_name).is_none() {
            return Err(Error::Validation(format!(
                "cluster {} is not part of domain {}",
                cluster_spec.cluster_name, topology.name
            )));
        }
    }

    for server_spec in &domain.spec.managed_servers {
        validate_managed_server(topology, &server_spec.server_name)?;
    }
    Ok(())
}

fn validate_managed_server(topology: &WlsDomainConfig, server_name: &str) -> Result<()> {
    if topology.servers.iter().any(|s| s.name == server_name) {
        return Ok(());
    }

    for cluster in &topology.clusters {
        match &cluster.dynamic_servers {
            Some(dynamic) => {
                if let Some(index) = server_name
                    .strip_prefix(dynamic.server_name_prefix.as_str())
                    .and_then(|suffix| suffix.parse::<i32>().ok())
                {
                    if index < 1 || index > dynamic.max_dynamic_cluster_size {
                        return Err(Error::Validation(format!(
                            "managed server {server_name} is outside the dynamic cluster {} \
                             (maximum size {})",
                            cluster.name, dynamic.max_dynamic_cluster_size
                        )));
                    }
                    return Ok(());
                }
            }
            None => {
                if cluster.servers.iter().any(|s| s.name == server_name) {
                    return Ok(());
                }
            }
        }
    }

    Err(Error::Validation(format!(
        "managed server {server_name} is not part of domain {}",
        topology.name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ClusterSpec, DomainSpec, ManagedServerSpec};
    use crate::topology::{WlsDynamicServersConfig, WlsServerConfig};

    fn dynamic_cluster(size: i32, max: i32) -> WlsClusterConfig {
        WlsClusterConfig {
            name: "cluster-1".into(),
            servers: Vec::new(),
            dynamic_servers: Some(WlsDynamicServersConfig {
                server_name_prefix: "managed-server".into(),
                dynamic_cluster_size: size,
                max_dynamic_cluster_size: max,
            }),
        }
    }

    fn static_cluster(names: &[&str]) -> WlsClusterConfig {
        WlsClusterConfig {
            name: "cluster-1".into(),
            servers: names
                .iter()
                .map(|n| WlsServerConfig {
                    name: (*n).into(),
                    listen_port: None,
                })
                .collect(),
            dynamic_servers: None,
        }
    }

    fn domain(replicas: i32) -> Domain {
        Domain::new(
            "sample",
            DomainSpec {
                domain_uid: Some("uid1".into()),
                clusters: vec![ClusterSpec {
                    cluster_name: "cluster-1".into(),
                    replicas: Some(replicas),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn with_server_policy(mut domain: Domain, server: &str, policy: ServerStartPolicy) -> Domain {
        domain.spec.managed_servers.push(ManagedServerSpec {
            server_name: server.into(),
            server_start_policy: Some(policy),
            ..Default::default()
        });
        domain
    }

    #[test]
    fn zero_replicas_starts_no_if_needed_server() {
        let started = started_servers(&domain(0), &dynamic_cluster(3, 5));
        assert!(started.is_empty());
    }

    #[test]
    fn replica_target_limits_started_members() {
        let started = started_servers(&domain(2), &dynamic_cluster(5, 5));
        assert_eq!(started, vec!["managed-server1", "managed-server2"]);
    }

    #[test]
    fn always_servers_start_ahead_of_the_rest() {
        // replicas=3 with two ALWAYS servers: both plus one IF_NEEDED.
        let d = with_server_policy(
            with_server_policy(domain(3), "managed-server4", ServerStartPolicy::Always),
            "managed-server5",
            ServerStartPolicy::Always,
        );
        let started = started_servers(&d, &dynamic_cluster(5, 5));
        assert_eq!(
            started,
            vec!["managed-server4", "managed-server5", "managed-server1"]
        );
    }

    #[test]
    fn promotion_to_always_displaces_the_default_member() {
        let d = with_server_policy(domain(1), "managed-server3", ServerStartPolicy::Always);
        let started = started_servers(&d, &dynamic_cluster(5, 5));
        assert_eq!(started, vec!["managed-server3"]);
    }

    #[test]
    fn never_servers_are_skipped_without_consuming_replicas() {
        let d = with_server_policy(domain(2), "managed-server1", ServerStartPolicy::Never);
        let started = started_servers(&d, &dynamic_cluster(4, 5));
        assert_eq!(started, vec!["managed-server2", "managed-server3"]);
    }

    #[test]
    fn domain_policy_admin_only_stops_all_managed_servers() {
        let mut d = domain(3);
        d.spec.server_start_policy = Some(ServerStartPolicy::AdminOnly);
        assert!(started_servers(&d, &dynamic_cluster(5, 5)).is_empty());
        assert!(admin_server_should_run(&d));

        d.spec.server_start_policy = Some(ServerStartPolicy::Never);
        assert!(!admin_server_should_run(&d));
    }

    #[test]
    fn static_members_walk_in_numeric_name_order() {
        let started = started_servers(&domain(2), &static_cluster(&["ms10", "ms2", "ms1"]));
        assert_eq!(started, vec!["ms1", "ms2"]);
    }

    #[test]
    fn started_set_ignores_managed_server_declaration_order() {
        let forward = with_server_policy(
            with_server_policy(domain(2), "managed-server2", ServerStartPolicy::Always),
            "managed-server4",
            ServerStartPolicy::Never,
        );
        let reversed = with_server_policy(
            with_server_policy(domain(2), "managed-server4", ServerStartPolicy::Never),
            "managed-server2",
            ServerStartPolicy::Always,
        );
        let cluster = dynamic_cluster(5, 5);
        assert_eq!(
            started_servers(&forward, &cluster),
            started_servers(&reversed, &cluster)
        );
    }

    #[test]
    fn promotion_and_demotion_replica_adjustments_preserve_members() {
        let cluster = dynamic_cluster(5, 5);
        // managed-server3 is not in the started set for replicas=1.
        assert_eq!(
            replica_count_preserving_promotion(&domain(1), &cluster, "managed-server3"),
            2
        );
        // managed-server1 already runs, no adjustment needed.
        assert_eq!(
            replica_count_preserving_promotion(&domain(1), &cluster, "managed-server1"),
            1
        );
        let promoted = with_server_policy(domain(2), "managed-server3", ServerStartPolicy::Always);
        assert_eq!(
            replica_count_preserving_demotion(&promoted, &cluster, "managed-server3"),
            1
        );
    }

    #[test]
    fn out_of_range_dynamic_server_fails_validation() {
        let topology = WlsDomainConfig {
            name: "base".into(),
            admin_server_name: "admin-server".into(),
            clusters: vec![dynamic_cluster(5, 5)],
            servers: vec![WlsServerConfig {
                name: "admin-server".into(),
                listen_port: Some(7001),
            }],
        };
        let bad = with_server_policy(domain(1), "managed-server7", ServerStartPolicy::IfNeeded);
        let err = validate_domain_against_topology(&bad, &topology).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let good = with_server_policy(domain(1), "managed-server5", ServerStartPolicy::IfNeeded);
        assert!(validate_domain_against_topology(&good, &topology).is_ok());
    }

    #[test]
    fn unknown_cluster_fails_validation() {
        let topology = WlsDomainConfig {
            name: "base".into(),
            admin_server_name: "admin-server".into(),
            clusters: Vec::new(),
            servers: Vec::new(),
        };
        let err = validate_domain_against_topology(&domain(1), &topology).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn duplicate_declarations_fail_spec_validation() {
        let mut d = domain(1);
        assert!(validate_domain_spec(&d).is_ok());
        d.spec.clusters.push(ClusterSpec {
            cluster_name: "cluster-1".into(),
            ..Default::default()
        });
        assert!(matches!(
            validate_domain_spec(&d).unwrap_err(),
            Error::Validation(_)
        ));

        let mut d = domain(1);
        d.spec.replicas = Some(-1);
        assert!(validate_domain_spec(&d).is_err());
    }

    #[test]
    fn natural_order_compares_digit_runs_numerically() {
        assert_eq!(natural_cmp("ms2", "ms10"), Ordering::Less);
        assert_eq!(natural_cmp("ms10", "ms10"), Ordering::Equal);
        assert_eq!(natural_cmp("a2b", "a2a"), Ordering::Greater);
    }
}
