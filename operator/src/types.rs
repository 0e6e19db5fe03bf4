//! Crate-wide error and result types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("domain validation failed: {0}")]
    Validation(String),

    #[error("introspection failed: {0}")]
    Introspection(String),

    #[error("FatalIntrospectorError: {0}")]
    FatalIntrospector(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("topology parse error: {0}")]
    Topology(#[from] serde_yaml::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry controller should schedule another make-right run.
    /// Validation and fatal introspector errors wait for a spec edit instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Validation(_) | Error::FatalIntrospector(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
