use thiserror::Error;

use crate::request::MetricId;

/// Result type alias for kpi-engine operations
pub type Result<T, E = KpiError> = std::result::Result<T, E>;

/// Errors that abort a whole batch. Everything scoped to a single metric is
/// recorded on its `MetricResult` instead.
#[derive(Error, Debug)]
pub enum KpiError {
    #[error("Failed to resolve accessible projects: {0}")]
    ProjectResolution(#[from] ResolveError),
}

/// Errors returned by a `ProjectResolver`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unknown hierarchy node: {0}")]
    UnknownNode(String),

    #[error("Project store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a metric strategy while computing a single metric
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Missing input data: {0}")]
    MissingData(String),

    #[error("Computation failed: {0}")]
    Computation(String),

    #[error("Strategy panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No strategy registered for metric {0}")]
pub struct StrategyNotFound(pub MetricId);

/// Errors raised by a side-channel source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Auxiliary source unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed auxiliary data: {0}")]
    Malformed(String),
}
