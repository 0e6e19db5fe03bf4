//! The make-right operation: decides whether a plan must run, builds the
//! up/down step chains, and retries failed runs with bounded backoff.

use crate::crds::{Domain, DomainSourceType, FATAL_INTROSPECTOR_ERROR};
use crate::kubernetes::is_first_newer;
use crate::presence::DomainPresenceInfo;
use crate::processor::DomainProcessor;
use crate::status::{EndProgressingStep, FailedStep};
use crate::steps::admin::{
    BeforeAdminServiceStep, CreateAdminPodStep, CreateAdminServiceStep,
    CreateExternalAdminServiceStep, WatchPodReadyAdminStep,
};
use crate::steps::delete::DeleteDomainStep;
use crate::steps::introspection::{
    AfterIntrospectValidationStep, CreateIntrospectorJobStep, DeleteIntrospectorJobStep,
    IntrospectionRequestStep, ReadExistingIntrospectorConfigMapStep, ReadIntrospectionOutputStep,
};
use crate::steps::managed::ManagedServersUpStep;
use crate::steps::presence::{
    DomainPresenceStep, DomainValidationStep, DownHeadStep, PopulatePacketServerMapsStep,
    StartPlanStep, TailStep, UnregisterStep, UpHeadStep,
};
use crate::types::Error;
use crate::work::{chain, CompletionCallback, Fiber, NextAction, Packet, Step, StepRef};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A factory which creates and executes the steps that align the actual
/// domain resources with the observed Domain resource.
pub struct MakeRightDomainOperation {
    processor: Arc<DomainProcessor>,
    live_info: Arc<DomainPresenceInfo>,
    explicit_recheck: bool,
    deleting: bool,
    will_interrupt: bool,
    from_retry: bool,
}

impl MakeRightDomainOperation {
    pub(crate) fn new(processor: Arc<DomainProcessor>, live_info: Arc<DomainPresenceInfo>) -> Self {
        Self {
            processor,
            live_info,
            explicit_recheck: false,
            deleting: false,
            will_interrupt: false,
            from_retry: false,
        }
    }

    /// Run even if the domain spec is unchanged.
    pub fn with_explicit_recheck(mut self) -> Self {
        self.explicit_recheck = true;
        self
    }

    /// Shut the domain down instead of bringing it up.
    pub fn for_deletion(mut self) -> Self {
        self.deleting = true;
        self
    }

    /// Carry over the deletion flag from a previous attempt.
    pub fn with_deleting(mut self, deleting: bool) -> Self {
        self.deleting = deleting;
        self
    }

    /// Cancel any in-flight make-right fiber before starting.
    pub fn interrupt(mut self) -> Self {
        self.will_interrupt = true;
        self
    }

    /// Marks this run as a scheduled retry of a failed one. Retries are
    /// bounded by the presence failure counter instead of the
    /// introspection give-up rule.
    fn as_retry(mut self) -> Self {
        self.from_retry = true;
        self
    }

    pub fn execute(self) {
        let namespace = self.live_info.namespace().to_string();
        if !self.processor.delegate().is_namespace_running(&namespace) {
            return;
        }
        if self.should_continue() {
            self.start_plan();
        } else {
            debug!(
                namespace,
                domain_uid = self.live_info.domain_uid(),
                "not starting make-right fiber"
            );
        }
    }

    /// The decision function: whether this trigger warrants a plan.
    fn should_continue(&self) -> bool {
        let live_domain = self.live_info.domain();
        let cached_info = self
            .processor
            .cache()
            .get(self.live_info.namespace(), self.live_info.domain_uid());
        let max_retries = self
            .processor
            .delegate()
            .tuning()
            .domain_presence_failure_retry_max_count;

        let failure_count = live_domain
            .as_ref()
            .map(|d| d.introspect_job_failure_count())
            .unwrap_or(0);
        let exceeded_retries = failure_count >= max_retries;

        // Initial adoption.
        let Some(cached_domain) = cached_info.as_ref().and_then(|info| info.domain()) else {
            return true;
        };
        let cached_info = cached_info.expect("cached info exists when its domain does");

        // Stale event: we already cached something newer.
        if let Some(live) = &live_domain {
            if is_first_newer(&cached_domain.metadata, &live.metadata) {
                return false;
            }
        }

        let versions_changed = versions_changed(live_domain.as_ref(), &cached_domain);
        if exceeded_retries && !versions_changed && !self.from_retry {
            debug!(
                max_retries,
                "introspection retries exhausted; waiting for an image, restartVersion or \
                 introspectVersion change"
            );
            return false;
        }

        if let Some(message) = live_domain.as_ref().and_then(|d| d.status_message()) {
            if message.contains(FATAL_INTROSPECTOR_ERROR) {
                debug!("fatal introspector error reported; waiting for a spec edit");
                return false;
            }
        }

        if self.explicit_recheck
            || spec_changed(live_domain.as_ref(), &cached_domain)
        {
            if let Some(live) = live_domain {
                // The failure count resets only when a version change
                // re-armed introspection after retries were exhausted.
                let rearm = exceeded_retries && versions_changed;
                self.prepare_live_domain(live, &cached_domain, rearm, failure_count, max_retries);
            }
            return true;
        }

        // Unchanged spec: refresh the cached status and stand down.
        if let Some(live) = live_domain {
            cached_info.set_domain(live);
        }
        false
    }

    /// Adjustments applied to the observed domain before the plan runs.
    fn prepare_live_domain(
        &self,
        mut live: Domain,
        cached: &Domain,
        rearm_introspection: bool,
        failure_count: i32,
        max_retries: i32,
    ) {
        let mut modified = false;

        // A Model-in-Image online update is only honored when nothing
        // beyond introspectVersion (and the switch itself) changed.
        if live.spec.domain_home_source_type == DomainSourceType::FromModel
            && live.spec.online_update_enabled()
            && !live.spec.is_spec_change_for_online_update_only(&cached.spec)
        {
            info!(
                domain_uid = self.live_info.domain_uid(),
                "spec changes go beyond introspectVersion; online update overridden to offline"
            );
            if let Some(online_update) = live
                .spec
                .configuration
                .as_mut()
                .and_then(|c| c.model.as_mut())
                .and_then(|m| m.online_update.as_mut())
            {
                online_update.enabled = false;
                modified = true;
            }
        }

        // The user changed one of the versions that re-arm introspection.
        if rearm_introspection {
            if let Some(status) = live.status.as_mut() {
                status.introspect_job_failure_count = 0;
                modified = true;
            }
        }

        if failure_count > 0 {
            info!(
                domain_uid = self.live_info.domain_uid(),
                failure_count, max_retries, "introspection previously failed; retrying"
            );
        }

        if modified {
            self.live_info.set_domain(live);
        }
    }

    fn start_plan(self) {
        debug!(
            namespace = self.live_info.namespace(),
            domain_uid = self.live_info.domain_uid(),
            deleting = self.deleting,
            "processing domain"
        );
        let steps = self.create_steps();
        let packet = Packet::new(self.live_info.clone());
        let gate = self.processor.make_right_gate(self.live_info.namespace());
        let observed_resource_version = self
            .live_info
            .domain()
            .and_then(|d| d.metadata.resource_version);
        let callback = Arc::new(MakeRightCompletion {
            processor: self.processor.clone(),
            namespace: self.live_info.namespace().to_string(),
            domain_uid: self.live_info.domain_uid().to_string(),
            deleting: self.deleting,
            observed_resource_version,
        });

        if self.will_interrupt {
            gate.start_fiber(self.live_info.domain_uid(), steps, packet, callback);
        } else {
            let started = gate.start_fiber_if_no_current_fiber(
                self.live_info.domain_uid(),
                steps,
                packet,
                callback,
            );
            if started.is_none() {
                // Coalesce: a fiber is already running. Record the newest
                // spec so the completion callback schedules a follow-up
                // run against it.
                if let Some(cached) = self
                    .processor
                    .cache()
                    .get(self.live_info.namespace(), self.live_info.domain_uid())
                {
                    if let Some(live) = self.live_info.domain() {
                        cached.set_domain(live);
                    }
                }
                debug!(
                    namespace = self.live_info.namespace(),
                    domain_uid = self.live_info.domain_uid(),
                    "make-right already running, coalesced spec update"
                );
            }
        }
    }

    /// Builds the plan: the populate/start prologue, then the up or down
    /// chain.
    pub(crate) fn create_steps(&self) -> Vec<StepRef> {
        let facade = self.processor.delegate().kubernetes();
        let tuning = self.processor.delegate().tuning();
        let cache = self.processor.cache().clone();

        let mut steps: Vec<StepRef> = vec![
            Arc::new(PopulatePacketServerMapsStep),
            StartPlanStep::new(cache.clone(), facade.clone()),
        ];

        if self.deleting {
            steps.push(DownHeadStep::new(self.processor.status_updaters().clone()));
            steps.push(DeleteDomainStep::new(facade));
            steps.push(UnregisterStep::new(cache));
            return steps;
        }

        let wait_timeout = Duration::from_secs(tuning.introspector_job_active_deadline_seconds.max(60));

        let admin_and_managed: Vec<StepRef> = vec![
            Arc::new(DomainStatusStep {
                processor: self.processor.clone(),
            }),
            Arc::new(BeforeAdminServiceStep),
            CreateAdminPodStep::new(facade.clone()),
            CreateExternalAdminServiceStep::new(facade.clone()),
            CreateAdminServiceStep::new(facade.clone()),
            WatchPodReadyAdminStep::new(facade.clone(), wait_timeout),
            ManagedServersUpStep::new(facade.clone()),
            EndProgressingStep::new(facade.clone()),
            Arc::new(TailStep),
        ];

        let introspection = chain(vec![
            Arc::new(IntrospectionRequestStep),
            DeleteIntrospectorJobStep::new(facade.clone()),
            CreateIntrospectorJobStep::new(
                facade.clone(),
                Duration::from_secs(tuning.introspector_job_active_deadline_seconds),
            ),
            ReadIntrospectionOutputStep::new(facade.clone()),
            Arc::new(AfterIntrospectValidationStep),
        ]);
        let mut domain_up: Vec<StepRef> = vec![introspection];
        domain_up.extend(admin_and_managed.iter().cloned());

        let managed_only: Vec<StepRef> = vec![
            Arc::new(DomainStatusStep {
                processor: self.processor.clone(),
            }),
            ManagedServersUpStep::new(facade.clone()),
            EndProgressingStep::new(facade.clone()),
            Arc::new(TailStep),
        ];

        steps.push(Arc::new(DomainValidationStep));
        steps.push(Arc::new(UpHeadStep));
        steps.push(ReadExistingIntrospectorConfigMapStep::new(facade));
        steps.push(DomainPresenceStep::new(domain_up, managed_only));
        steps
    }
}

fn spec_changed(live: Option<&Domain>, cached: &Domain) -> bool {
    live.map(|d| d.spec != cached.spec).unwrap_or(true)
}

/// Whether any of image, restartVersion or introspectVersion differ
/// between the observed and cached domains; these re-arm introspection
/// after retries are exhausted.
fn versions_changed(live: Option<&Domain>, cached: &Domain) -> bool {
    let Some(live) = live else {
        return false;
    };
    live.introspect_version() != cached.introspect_version()
        || live.restart_version() != cached.restart_version()
        || live.spec.image != cached.spec.image
}

/// Starts the periodic status updater once the plan reaches the point
/// where servers exist to report on.
struct DomainStatusStep {
    processor: Arc<DomainProcessor>,
}

#[async_trait]
impl Step for DomainStatusStep {
    fn name(&self) -> &str {
        "DomainStatus"
    }

    async fn apply(&self, packet: &mut Packet) -> crate::types::Result<NextAction> {
        self.processor
            .schedule_domain_status_updating(packet.info().clone());
        Ok(NextAction::Continue)
    }
}

/// Completion callback of every make-right fiber: reports failures on
/// the Domain status and schedules bounded retries.
struct MakeRightCompletion {
    processor: Arc<DomainProcessor>,
    namespace: String,
    domain_uid: String,
    deleting: bool,
    /// Domain resourceVersion the plan ran against; a different cached
    /// version at completion means events were coalesced during the run.
    observed_resource_version: Option<String>,
}

impl MakeRightCompletion {
    fn report_failure(&self, packet: &Packet, error: &Error) {
        let Some(current) = Fiber::current() else {
            return;
        };
        let counts_against_introspection = matches!(
            error,
            Error::Introspection(_) | Error::FatalIntrospector(_)
        );
        let failed_step = FailedStep::new(
            self.processor.delegate().kubernetes(),
            failure_reason(error),
            &error.to_string(),
            counts_against_introspection,
        );
        let gate = self.processor.make_right_gate(&self.namespace);
        gate.start_fiber_if_last_fiber_matches(
            &self.domain_uid,
            &current,
            vec![failed_step],
            Packet::new(packet.info().clone()),
            Arc::new(FailureReportCallback),
        );
    }

    fn schedule_retry(&self) {
        let processor = self.processor.clone();
        let namespace = self.namespace.clone();
        let domain_uid = self.domain_uid.clone();
        let deleting = self.deleting;
        let tuning = self.processor.delegate().tuning();
        let delay = Duration::from_secs(tuning.domain_presence_failure_retry_seconds);
        let max_retries = tuning.domain_presence_failure_retry_max_count;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(existing) = processor.cache().get(&namespace, &domain_uid) else {
                return;
            };
            existing.set_populated(false);
            let retry_count = existing.increment_and_get_failure_count();
            debug!(namespace, domain_uid, retry_count, "make-right failure count");
            if retry_count <= max_retries {
                processor
                    .make_right(existing)
                    .with_deleting(deleting)
                    .with_explicit_recheck()
                    .as_retry()
                    .execute();
            } else {
                error!(
                    namespace,
                    domain_uid,
                    max_retries,
                    "cannot bring domain up after maximum retries; waiting for a spec change"
                );
            }
        });
    }
}

impl CompletionCallback for MakeRightCompletion {
    fn on_completion(&self, _packet: &Packet) {
        if self.deleting {
            return;
        }
        // Pick up any spec change that arrived while this plan ran.
        let Some(cached) = self.processor.cache().get(&self.namespace, &self.domain_uid) else {
            return;
        };
        let cached_version = cached
            .domain()
            .and_then(|d| d.metadata.resource_version);
        if cached_version != self.observed_resource_version {
            debug!(
                namespace = self.namespace,
                domain_uid = self.domain_uid,
                "coalesced spec update detected, running make-right again"
            );
            self.processor
                .make_right(cached)
                .with_explicit_recheck()
                .execute();
        }
    }

    fn on_throwable(&self, packet: &Packet, error: &Error) {
        warn!(
            namespace = self.namespace,
            domain_uid = self.domain_uid,
            %error,
            "make-right fiber failed"
        );
        self.report_failure(packet, error);
        if error.is_retryable() {
            self.schedule_retry();
        }
    }
}

fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::Validation(_) => "DomainInvalid",
        Error::Introspection(_) | Error::FatalIntrospector(_) => "Introspection",
        Error::Kube(_) => "KubernetesApiFailure",
        Error::Timeout(_) => "Timeout",
        _ => "Internal",
    }
}

struct FailureReportCallback;

impl CompletionCallback for FailureReportCallback {
    fn on_completion(&self, _packet: &Packet) {}

    fn on_throwable(&self, packet: &Packet, error: &Error) {
        warn!(
            namespace = packet.info().namespace(),
            domain_uid = packet.info().domain_uid(),
            %error,
            "failed to record domain failure status"
        );
    }
}
