//! In-process view of every domain the operator manages.

use crate::crds::Domain;
use crate::kubernetes::is_first_newer;
use crate::topology::WlsDomainConfig;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

/// Mutable presence record for one `(namespace, domainUid)`. Watch
/// handlers and steps update it concurrently, so every field sits behind
/// an atomic or a lock.
pub struct DomainPresenceInfo {
    namespace: String,
    domain_uid: String,
    domain: RwLock<Option<Domain>>,
    server_pods: RwLock<HashMap<String, Pod>>,
    services: RwLock<HashMap<String, Service>>,
    deleting: AtomicBool,
    populated: AtomicBool,
    failure_count: AtomicI32,
    last_known_server_status: RwLock<HashMap<String, String>>,
    being_deleted: RwLock<HashMap<String, bool>>,
    last_topology: RwLock<Option<WlsDomainConfig>>,
}

impl DomainPresenceInfo {
    pub fn new(namespace: &str, domain_uid: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            domain_uid: domain_uid.to_string(),
            domain: RwLock::new(None),
            server_pods: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            deleting: AtomicBool::new(false),
            populated: AtomicBool::new(false),
            failure_count: AtomicI32::new(0),
            last_known_server_status: RwLock::new(HashMap::new()),
            being_deleted: RwLock::new(HashMap::new()),
            last_topology: RwLock::new(None),
        }
    }

    pub fn from_domain(domain: Domain) -> Self {
        let namespace = domain.namespace().unwrap_or_default();
        let info = Self::new(&namespace, &domain.domain_uid());
        *info.domain.write().unwrap() = Some(domain);
        info
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn domain_uid(&self) -> &str {
        &self.domain_uid
    }

    pub fn domain(&self) -> Option<Domain> {
        self.domain.read().unwrap().clone()
    }

    pub fn set_domain(&self, domain: Domain) {
        *self.domain.write().unwrap() = Some(domain);
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    pub fn is_not_deleting(&self) -> bool {
        !self.is_deleting()
    }

    pub fn set_deleting(&self, deleting: bool) {
        self.deleting.store(deleting, Ordering::Release);
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn set_populated(&self, populated: bool) {
        self.populated.store(populated, Ordering::Release);
    }

    pub fn failure_count(&self) -> i32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn increment_and_get_failure_count(&self) -> i32 {
        self.failure_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Marks a successful make-right pass.
    pub fn complete(&self) {
        self.failure_count.store(0, Ordering::Release);
    }

    /// Seeds a server pod unconditionally (initial LIST).
    pub fn set_server_pod(&self, server_name: &str, pod: Pod) {
        self.server_pods
            .write()
            .unwrap()
            .insert(server_name.to_string(), pod);
    }

    /// Applies a pod watch event, ignoring events older than the cache.
    pub fn set_server_pod_from_event(&self, server_name: &str, pod: Pod) {
        let mut pods = self.server_pods.write().unwrap();
        if let Some(cached) = pods.get(server_name) {
            if is_first_newer(&cached.metadata, &pod.metadata) {
                return;
            }
        }
        pods.insert(server_name.to_string(), pod);
    }

    /// Applies a pod DELETED event. The cached pod is dropped only when
    /// its UID matches the deleted object; returns whether it was.
    pub fn delete_server_pod_from_event(&self, server_name: &str, pod: &Pod) -> bool {
        let mut pods = self.server_pods.write().unwrap();
        match pods.get(server_name) {
            Some(cached) if cached.metadata.uid == pod.metadata.uid => {
                pods.remove(server_name);
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    pub fn server_pod(&self, server_name: &str) -> Option<Pod> {
        self.server_pods.read().unwrap().get(server_name).cloned()
    }

    pub fn server_pods(&self) -> HashMap<String, Pod> {
        self.server_pods.read().unwrap().clone()
    }

    pub fn remove_server_pod(&self, server_name: &str) {
        self.server_pods.write().unwrap().remove(server_name);
    }

    pub fn set_service_from_event(&self, service_name: &str, service: Service) {
        let mut services = self.services.write().unwrap();
        if let Some(cached) = services.get(service_name) {
            if is_first_newer(&cached.metadata, &service.metadata) {
                return;
            }
        }
        services.insert(service_name.to_string(), service);
    }

    pub fn delete_service_from_event(&self, service_name: &str, service: &Service) -> bool {
        let mut services = self.services.write().unwrap();
        match services.get(service_name) {
            Some(cached) if cached.metadata.uid == service.metadata.uid => {
                services.remove(service_name);
                true
            }
            _ => false,
        }
    }

    pub fn service(&self, service_name: &str) -> Option<Service> {
        self.services.read().unwrap().get(service_name).cloned()
    }

    pub fn services(&self) -> HashMap<String, Service> {
        self.services.read().unwrap().clone()
    }

    pub fn update_last_known_server_status(&self, server_name: &str, status: &str) {
        self.last_known_server_status
            .write()
            .unwrap()
            .insert(server_name.to_string(), status.to_string());
    }

    pub fn last_known_server_status(&self, server_name: &str) -> Option<String> {
        self.last_known_server_status
            .read()
            .unwrap()
            .get(server_name)
            .cloned()
    }

    pub fn set_server_pod_being_deleted(&self, server_name: &str, value: bool) {
        self.being_deleted
            .write()
            .unwrap()
            .insert(server_name.to_string(), value);
    }

    pub fn is_server_pod_being_deleted(&self, server_name: &str) -> bool {
        self.being_deleted
            .read()
            .unwrap()
            .get(server_name)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_last_topology(&self, topology: WlsDomainConfig) {
        *self.last_topology.write().unwrap() = Some(topology);
    }

    pub fn last_topology(&self) -> Option<WlsDomainConfig> {
        self.last_topology.read().unwrap().clone()
    }
}

/// Process-wide map `namespace → domainUid → DomainPresenceInfo`.
#[derive(Default)]
pub struct DomainPresenceCache {
    domains: RwLock<HashMap<String, HashMap<String, Arc<DomainPresenceInfo>>>>,
}

impl DomainPresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, domain_uid: &str) -> Option<Arc<DomainPresenceInfo>> {
        self.domains
            .read()
            .unwrap()
            .get(namespace)
            .and_then(|m| m.get(domain_uid))
            .cloned()
    }

    pub fn register(&self, info: Arc<DomainPresenceInfo>) {
        self.domains
            .write()
            .unwrap()
            .entry(info.namespace().to_string())
            .or_default()
            .insert(info.domain_uid().to_string(), info);
    }

    pub fn unregister(&self, namespace: &str, domain_uid: &str) {
        if let Some(map) = self.domains.write().unwrap().get_mut(namespace) {
            map.remove(domain_uid);
        }
    }

    /// Snapshot of every info in a namespace; safe to iterate while the
    /// cache is mutated elsewhere.
    pub fn namespace_snapshot(&self, namespace: &str) -> Vec<Arc<DomainPresenceInfo>> {
        self.domains
            .read()
            .unwrap()
            .get(namespace)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolves the presence info owning a resource named
    /// `"{domainUid}-{suffix}"`, returning the info and the suffix.
    pub fn find_owner(
        &self,
        namespace: &str,
        object_name: &str,
    ) -> Option<(Arc<DomainPresenceInfo>, String)> {
        let domains = self.domains.read().unwrap();
        let map = domains.get(namespace)?;
        map.values()
            .filter_map(|info| {
                object_name
                    .strip_prefix(&format!("{}-", info.domain_uid()))
                    .map(|suffix| (info.clone(), suffix.to_string()))
            })
            .max_by_key(|(info, _)| info.domain_uid().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(resource_version: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                resource_version: Some(resource_version.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn stale_pod_events_are_ignored() {
        let info = DomainPresenceInfo::new("ns", "uid1");
        info.set_server_pod_from_event("ms1", pod("10", "a"));
        info.set_server_pod_from_event("ms1", pod("5", "a"));
        assert_eq!(
            info.server_pod("ms1").unwrap().metadata.resource_version.as_deref(),
            Some("10")
        );
        info.set_server_pod_from_event("ms1", pod("11", "a"));
        assert_eq!(
            info.server_pod("ms1").unwrap().metadata.resource_version.as_deref(),
            Some("11")
        );
    }

    #[test]
    fn delete_event_requires_matching_uid() {
        let info = DomainPresenceInfo::new("ns", "uid1");
        info.set_server_pod_from_event("ms1", pod("10", "a"));
        // The pod was recreated since this DELETED event was emitted.
        assert!(!info.delete_server_pod_from_event("ms1", &pod("9", "b")));
        assert!(info.server_pod("ms1").is_some());
        assert!(info.delete_server_pod_from_event("ms1", &pod("10", "a")));
        assert!(info.server_pod("ms1").is_none());
    }

    #[test]
    fn cache_holds_one_info_per_domain() {
        let cache = DomainPresenceCache::new();
        let info = Arc::new(DomainPresenceInfo::new("ns", "uid1"));
        cache.register(info.clone());
        cache.register(Arc::new(DomainPresenceInfo::new("ns", "uid1")));
        assert_eq!(cache.namespace_snapshot("ns").len(), 1);
        assert!(cache.get("ns", "uid1").is_some());
        cache.unregister("ns", "uid1");
        assert!(cache.get("ns", "uid1").is_none());
    }

    #[test]
    fn find_owner_prefers_the_longest_uid_prefix() {
        let cache = DomainPresenceCache::new();
        cache.register(Arc::new(DomainPresenceInfo::new("ns", "domain")));
        cache.register(Arc::new(DomainPresenceInfo::new("ns", "domain-two")));
        let (info, suffix) = cache.find_owner("ns", "domain-two-ms1").unwrap();
        assert_eq!(info.domain_uid(), "domain-two");
        assert_eq!(suffix, "ms1");
    }

    #[test]
    fn failure_counter_resets_on_complete() {
        let info = DomainPresenceInfo::new("ns", "uid1");
        assert_eq!(info.increment_and_get_failure_count(), 1);
        assert_eq!(info.increment_and_get_failure_count(), 2);
        info.complete();
        assert_eq!(info.failure_count(), 0);
    }
}
