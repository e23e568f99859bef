// src/error.rs
use crate::endpoint::EndpointKey;
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HealthError {
    #[error("health checker context for {endpoint} has been destroyed")]
    ContextDestroyed { endpoint: EndpointKey },

    #[error("health-checked endpoint group is closed")]
    Closed,

    #[error("client factory has been closed")]
    FactoryClosed,

    #[error("no tokio runtime available to drive health checks")]
    NoRuntime,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid health check configuration: {0}")]
    Config(String),

    #[error("failed to build probe client: {0}")]
    Client(String),

    #[error("{} health checker(s) failed to close: {}", .0.len(), CloseFailures(.0))]
    CheckerClose(Vec<CheckerCloseFailure>),
}

impl HealthError {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, HealthError::ContextDestroyed { .. })
    }
}

/// A checker whose close hook returned an error while its group was closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerCloseFailure {
    pub endpoint: EndpointKey,
    pub reason: String,
}

struct CloseFailures<'a>(&'a [CheckerCloseFailure]);

impl fmt::Display for CloseFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.endpoint, failure.reason)?;
        }
        Ok(())
    }
}

pub type Result<T, E = HealthError> = std::result::Result<T, E>;
