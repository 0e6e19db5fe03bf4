//! Operator tuning parameters, loaded from the operator ConfigMap and
//! re-readable at runtime.

use k8s_openapi::api::core::v1::ConfigMap;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::warn;

/// Main-loop tuning knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MainTuning {
    /// Delay before and between status-updater ticks, seconds
    pub initial_short_delay: u64,
    /// Bound on one status read, seconds
    pub status_update_timeout_seconds: u64,
    /// Delay before a failed make-right is retried, seconds
    pub domain_presence_failure_retry_seconds: u64,
    /// Retries allowed before make-right gives up until a spec change
    pub domain_presence_failure_retry_max_count: i32,
    /// Deadline for the introspector job, seconds
    pub introspector_job_active_deadline_seconds: u64,
}

impl Default for MainTuning {
    fn default() -> Self {
        Self {
            initial_short_delay: 5,
            status_update_timeout_seconds: 10,
            domain_presence_failure_retry_seconds: 10,
            domain_presence_failure_retry_max_count: 5,
            introspector_job_active_deadline_seconds: 120,
        }
    }
}

/// Runtime-observable tuning snapshot holder.
#[derive(Default)]
pub struct TuningParameters {
    main: RwLock<MainTuning>,
}

impl TuningParameters {
    pub fn new(main: MainTuning) -> Self {
        Self {
            main: RwLock::new(main),
        }
    }

    pub fn main(&self) -> MainTuning {
        *self.main.read().unwrap()
    }

    /// Re-reads every knob from the operator ConfigMap, keeping defaults
    /// for keys that are absent or unparsable.
    pub fn update_from_config_map(&self, config_map: &ConfigMap) {
        let defaults = MainTuning::default();
        let parsed = match &config_map.data {
            Some(data) => MainTuning {
                initial_short_delay: parse_or(
                    data.get("initialShortDelay"),
                    "initialShortDelay",
                    defaults.initial_short_delay,
                ),
                status_update_timeout_seconds: parse_or(
                    data.get("statusUpdateTimeoutSeconds"),
                    "statusUpdateTimeoutSeconds",
                    defaults.status_update_timeout_seconds,
                ),
                domain_presence_failure_retry_seconds: parse_or(
                    data.get("domainPresenceFailureRetrySeconds"),
                    "domainPresenceFailureRetrySeconds",
                    defaults.domain_presence_failure_retry_seconds,
                ),
                domain_presence_failure_retry_max_count: parse_or(
                    data.get("domainPresenceFailureRetryMaxCount"),
                    "domainPresenceFailureRetryMaxCount",
                    defaults.domain_presence_failure_retry_max_count,
                ),
                introspector_job_active_deadline_seconds: parse_or(
                    data.get("introspectorJobActiveDeadlineSeconds"),
                    "introspectorJobActiveDeadlineSeconds",
                    defaults.introspector_job_active_deadline_seconds,
                ),
            },
            None => defaults,
        };
        *self.main.write().unwrap() = parsed;
    }
}

fn parse_or<T: FromStr + Copy>(value: Option<&String>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable tuning value {}={}", key, raw);
            default
        }),
    }
}
