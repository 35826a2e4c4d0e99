//! Batch computation of KPI metrics over a project hierarchy.
//!
//! A batch request names the metrics to compute, the hierarchy level to
//! report at and the trend window. [`BatchPipeline`] resolves the projects
//! the caller may see, answers from the result cache when it can and
//! otherwise computes every metric in parallel on its own copy of the tree.

pub mod assembler;
pub mod cache;
pub mod config;
pub mod errors;
pub mod executor;
pub mod metrics_defs;
pub mod node;
pub mod pipeline;
pub mod pool;
pub mod projects;
pub mod reducer;
pub mod request;
pub mod result;
pub mod side_channel;
pub mod strategy;

#[cfg(test)]
mod testutils;

pub use errors::{KpiError, Result};
pub use pipeline::{BatchPipeline, Collaborators};
