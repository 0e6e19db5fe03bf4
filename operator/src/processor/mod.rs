//! The domain processor: receives watch events, decides whether a
//! make-right run is needed, and drives plans through per-namespace
//! fiber gates.

mod dispatch;
mod make_right;

pub use make_right::MakeRightDomainOperation;

use crate::crds::Domain;
use crate::kubernetes::KubernetesFacade;
use crate::presence::{DomainPresenceCache, DomainPresenceInfo};
use crate::status::{
    OncePerMessageLoggingFilter, RemainingServersHealthToRead, ServerStatusReaderStep,
    StatusUpdateStep, StatusUpdaters,
};
use crate::tuning::{MainTuning, TuningParameters};
use crate::types::Error;
use crate::work::{CompletionCallback, Fiber, FiberGate, Packet, StepRef};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Environment the processor runs in. The production implementation is
/// [`OperatorDelegate`]; tests substitute their own.
pub trait DomainProcessorDelegate: Send + Sync {
    fn kubernetes(&self) -> Arc<dyn KubernetesFacade>;

    /// Whether the operator still manages the namespace; make-right
    /// requests for stopped namespaces are dropped.
    fn is_namespace_running(&self, namespace: &str) -> bool;

    fn tuning(&self) -> MainTuning;
}

/// Production delegate: a facade, the tuning snapshot holder, and the
/// set of managed namespaces.
pub struct OperatorDelegate {
    facade: Arc<dyn KubernetesFacade>,
    tuning: Arc<TuningParameters>,
    namespaces: RwLock<HashSet<String>>,
}

impl OperatorDelegate {
    pub fn new(facade: Arc<dyn KubernetesFacade>, tuning: Arc<TuningParameters>) -> Arc<Self> {
        Arc::new(Self {
            facade,
            tuning,
            namespaces: RwLock::new(HashSet::new()),
        })
    }

    pub fn start_namespace(&self, namespace: &str) {
        self.namespaces.write().unwrap().insert(namespace.to_string());
    }

    pub fn stop_namespace(&self, namespace: &str) {
        self.namespaces.write().unwrap().remove(namespace);
    }
}

impl DomainProcessorDelegate for OperatorDelegate {
    fn kubernetes(&self) -> Arc<dyn KubernetesFacade> {
        self.facade.clone()
    }

    fn is_namespace_running(&self, namespace: &str) -> bool {
        self.namespaces.read().unwrap().contains(namespace)
    }

    fn tuning(&self) -> MainTuning {
        self.tuning.main()
    }
}

/// Process-wide engine state: the presence cache, one make-right gate
/// and one status gate per namespace, and the status-updater registry.
pub struct DomainProcessor {
    delegate: Arc<dyn DomainProcessorDelegate>,
    cache: Arc<DomainPresenceCache>,
    make_right_gates: Mutex<HashMap<String, Arc<FiberGate>>>,
    status_gates: Mutex<HashMap<String, Arc<FiberGate>>>,
    status_updaters: Arc<StatusUpdaters>,
}

impl DomainProcessor {
    pub fn new(delegate: Arc<dyn DomainProcessorDelegate>) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            cache: Arc::new(DomainPresenceCache::new()),
            make_right_gates: Mutex::new(HashMap::new()),
            status_gates: Mutex::new(HashMap::new()),
            status_updaters: Arc::new(StatusUpdaters::new()),
        })
    }

    pub fn cache(&self) -> &Arc<DomainPresenceCache> {
        &self.cache
    }

    pub(crate) fn delegate(&self) -> &Arc<dyn DomainProcessorDelegate> {
        &self.delegate
    }

    pub(crate) fn status_updaters(&self) -> &Arc<StatusUpdaters> {
        &self.status_updaters
    }

    pub(crate) fn make_right_gate(&self, namespace: &str) -> Arc<FiberGate> {
        self.make_right_gates
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(FiberGate::new()))
            .clone()
    }

    pub(crate) fn status_gate(&self, namespace: &str) -> Arc<FiberGate> {
        self.status_gates
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(FiberGate::new()))
            .clone()
    }

    /// Snapshot of the active make-right fibers in a namespace.
    pub fn current_make_right_fibers(&self, namespace: &str) -> HashMap<String, Arc<Fiber>> {
        self.make_right_gate(namespace).current_fibers()
    }

    /// Builds a make-right operation for presence info read from the
    /// cluster.
    pub fn make_right(self: &Arc<Self>, live_info: Arc<DomainPresenceInfo>) -> MakeRightDomainOperation {
        MakeRightDomainOperation::new(self.clone(), live_info)
    }

    /// Builds a make-right operation directly from a watched Domain.
    pub fn make_right_domain(self: &Arc<Self>, domain: Domain) -> MakeRightDomainOperation {
        self.make_right(Arc::new(DomainPresenceInfo::from_domain(domain)))
    }

    /// Shuts down every domain the operator manages in a namespace.
    pub fn stop_namespace(self: &Arc<Self>, namespace: &str) {
        for info in self.cache.namespace_snapshot(namespace) {
            let value = match info.domain() {
                Some(domain) => DomainPresenceInfo::from_domain(domain),
                None => DomainPresenceInfo::new(info.namespace(), info.domain_uid()),
            };
            value.set_deleting(true);
            value.set_populated(true);
            self.make_right(Arc::new(value))
                .with_explicit_recheck()
                .for_deletion()
                .execute();
        }
    }

    /// Logs every suspended fiber, the first step toward diagnosing
    /// stuck plans.
    pub fn report_suspended_fibers(&self) {
        let gates: Vec<(String, Arc<FiberGate>)> = {
            let make_right = self.make_right_gates.lock().unwrap();
            let status = self.status_gates.lock().unwrap();
            make_right
                .iter()
                .chain(status.iter())
                .map(|(ns, gate)| (ns.clone(), gate.clone()))
                .collect()
        };
        for (namespace, gate) in gates {
            for (domain_uid, fiber) in gate.current_fibers() {
                if let Some(step) = fiber.suspended_step() {
                    debug!(namespace, domain_uid, step, "fiber is suspended");
                }
            }
        }
    }

    /// Runs an ad-hoc step chain outside any gate, logging failures.
    pub(crate) fn run_steps(&self, info: Arc<DomainPresenceInfo>, steps: Vec<StepRef>) {
        Fiber::start_detached(steps, Packet::new(info), Arc::new(LoggingCallback));
    }

    /// Schedules (or reschedules) the periodic status updater for a
    /// domain. Each tick starts a status-read fiber on the status gate,
    /// independent of make-right work.
    pub(crate) fn schedule_domain_status_updating(self: &Arc<Self>, info: Arc<DomainPresenceInfo>) {
        let tuning = self.delegate.tuning();
        let delay = Duration::from_secs(tuning.initial_short_delay.max(1));
        let filter = OncePerMessageLoggingFilter::new();
        let processor = self.clone();
        let task_info = info.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + delay, delay);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                processor.run_status_read(&task_info, &filter);
            }
        });
        self.status_updaters
            .register(info.namespace(), info.domain_uid(), task);
    }

    fn run_status_read(
        self: &Arc<Self>,
        info: &Arc<DomainPresenceInfo>,
        filter: &Arc<OncePerMessageLoggingFilter>,
    ) {
        let tuning = self.delegate.tuning();
        let steps: Vec<StepRef> = vec![
            Arc::new(ServerStatusReaderStep),
            StatusUpdateStep::new(
                self.delegate.kubernetes(),
                Duration::from_secs(tuning.status_update_timeout_seconds),
            ),
        ];
        let gate = self.status_gate(info.namespace());
        gate.start_fiber_if_no_current_fiber(
            info.domain_uid(),
            steps,
            Packet::new(info.clone()),
            Arc::new(StatusReadCallback {
                filter: filter.clone(),
            }),
        );
    }
}

struct LoggingCallback;

impl CompletionCallback for LoggingCallback {
    fn on_completion(&self, _packet: &Packet) {}

    fn on_throwable(&self, packet: &Packet, error: &Error) {
        warn!(
            namespace = packet.info().namespace(),
            domain_uid = packet.info().domain_uid(),
            %error,
            "step chain failed"
        );
    }
}

struct StatusReadCallback {
    filter: Arc<OncePerMessageLoggingFilter>,
}

impl CompletionCallback for StatusReadCallback {
    fn on_completion(&self, packet: &Packet) {
        let fully_read = packet
            .get::<RemainingServersHealthToRead>()
            .map(|r| r.0 == 0)
            .unwrap_or(true);
        if fully_read {
            self.filter.set_filtering(false).reset_log_history();
        } else {
            self.filter.set_filtering(true);
        }
    }

    fn on_throwable(&self, packet: &Packet, error: &Error) {
        let message = error.to_string();
        if self.filter.can_log(&message) {
            error!(
                namespace = packet.info().namespace(),
                domain_uid = packet.info().domain_uid(),
                %error,
                "status read failed"
            );
        }
        self.filter.set_filtering(true);
    }
}
