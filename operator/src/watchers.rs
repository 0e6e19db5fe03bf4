//! Raw watch loops feeding the dispatcher. Each loop tracks the last
//! `resourceVersion`, reconnects on stream errors, and on `410 Gone`
//! re-lists to reseed before watching again.

use crate::crds::Domain;
use crate::labels::{CREATEDBYOPERATOR_LABEL, DOMAINUID_LABEL};
use crate::processor::DomainProcessor;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Service};
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const GONE: u16 = 410;

/// Starts all five watchers for one namespace.
pub fn start_watchers(
    processor: &Arc<DomainProcessor>,
    client: &Client,
    namespace: &str,
) -> Vec<JoinHandle<()>> {
    let operator_selector = format!("{CREATEDBYOPERATOR_LABEL}=true");

    vec![
        spawn_watcher::<Domain>(
            Api::namespaced(client.clone(), namespace),
            WatchParams::default(),
            processor.clone(),
            namespace.to_string(),
            |processor, event| processor.dispatch_domain_watch(event),
        ),
        spawn_watcher::<Pod>(
            Api::namespaced(client.clone(), namespace),
            WatchParams::default().labels(DOMAINUID_LABEL),
            processor.clone(),
            namespace.to_string(),
            |processor, event| processor.dispatch_pod_watch(event),
        ),
        spawn_watcher::<Service>(
            Api::namespaced(client.clone(), namespace),
            WatchParams::default().labels(DOMAINUID_LABEL),
            processor.clone(),
            namespace.to_string(),
            |processor, event| processor.dispatch_service_watch(event),
        ),
        spawn_watcher::<ConfigMap>(
            Api::namespaced(client.clone(), namespace),
            WatchParams::default().labels(&operator_selector),
            processor.clone(),
            namespace.to_string(),
            |processor, event| processor.dispatch_config_map_watch(event),
        ),
        spawn_watcher::<Event>(
            Api::namespaced(client.clone(), namespace),
            WatchParams::default(),
            processor.clone(),
            namespace.to_string(),
            |processor, event| processor.dispatch_event_watch(event),
        ),
    ]
}

fn spawn_watcher<K>(
    api: Api<K>,
    params: WatchParams,
    processor: Arc<DomainProcessor>,
    namespace: String,
    dispatch: fn(&Arc<DomainProcessor>, WatchEvent<K>),
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    tokio::spawn(async move {
        watch_loop(api, params, processor, namespace, dispatch).await;
    })
}

async fn watch_loop<K>(
    api: Api<K>,
    params: WatchParams,
    processor: Arc<DomainProcessor>,
    namespace: String,
    dispatch: fn(&Arc<DomainProcessor>, WatchEvent<K>),
)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut resource_version = list_resource_version(&api).await;

    loop {
        let stream = match api.watch(&params, &resource_version).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(namespace, %error, "watch connect failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let mut stream = stream.boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    resource_version = bookmark.metadata.resource_version;
                }
                Ok(WatchEvent::Error(response)) if response.code == GONE => {
                    // History is gone: reseed from a fresh list and make
                    // every domain of the namespace re-list its resources.
                    debug!(namespace, "watch history expired, reseeding");
                    for info in processor.cache().namespace_snapshot(&namespace) {
                        info.set_populated(false);
                    }
                    resource_version = list_resource_version(&api).await;
                    break;
                }
                Ok(WatchEvent::Error(response)) => {
                    warn!(namespace, code = response.code, message = %response.message, "watch error");
                }
                Ok(event) => {
                    if let Some(version) = event_resource_version(&event) {
                        resource_version = version;
                    }
                    dispatch(&processor, event);
                }
                Err(error) => {
                    warn!(namespace, %error, "watch stream failed");
                    break;
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn list_resource_version<K>(api: &Api<K>) -> String
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.list(&ListParams::default().limit(1)).await {
        Ok(list) => list.metadata.resource_version.unwrap_or_else(|| "0".to_string()),
        Err(error) => {
            warn!(%error, "list for watch seed failed");
            "0".to_string()
        }
    }
}

fn event_resource_version<K: Resource>(event: &WatchEvent<K>) -> Option<String> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            obj.meta().resource_version.clone()
        }
        _ => None,
    }
}
