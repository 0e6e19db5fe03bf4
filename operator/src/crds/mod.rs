pub mod domain;

pub use domain::{
    AdminServer, AdminService, Channel, ClusterSpec, ClusterStatus, Configuration, Domain,
    DomainCondition, DomainSourceType, DomainSpec, DomainStatus, ManagedServerSpec,
    ModelConfiguration, OnlineUpdate, ServerHealth, ServerPod, ServerStartPolicy, ServerStatus,
    Shutdown, SubsystemHealth, FATAL_INTROSPECTOR_ERROR, RUNNING_STATE, SHUTDOWN_STATE,
    STARTING_STATE,
};
