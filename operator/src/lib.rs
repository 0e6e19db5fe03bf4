#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! WebLogic domain operator core
//!
//! This crate watches Domain resources and drives the cluster toward
//! their declared intent: it runs the administration server and the
//! configured managed servers, restarts them on relevant configuration
//! changes, scales clusters, and tears everything down on deletion. The
//! heart of the crate is the reconciliation engine: watch dispatch,
//! make-right planning, and the step/fiber runtime that executes plans
//! with at most one active plan per domain.

pub mod crds;
pub mod kubernetes;
pub mod labels;
pub mod policy;
pub mod presence;
pub mod processor;
pub mod status;
pub mod steps;
pub mod topology;
pub mod tuning;
pub mod types;
pub mod watchers;
pub mod work;

// Re-export commonly used types
pub use crds::{Domain, DomainSpec, DomainStatus, ServerStartPolicy};
pub use kubernetes::{KubeFacade, KubernetesFacade};
pub use presence::{DomainPresenceCache, DomainPresenceInfo};
pub use processor::{DomainProcessor, DomainProcessorDelegate, MakeRightDomainOperation, OperatorDelegate};
pub use tuning::{MainTuning, TuningParameters};
pub use types::{Error, Result};
