//! Turns the unordered output of the executor into the batch response.

use indexmap::IndexMap;
use shared::counter;
use std::collections::VecDeque;

use crate::metrics_defs::RESULTS_RECONCILED;
use crate::request::{BatchRequest, MetricDescriptor, MetricId};
use crate::result::MetricResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The tracker id marks the request as an export
    Export,
    /// Results are aggregated below the project level
    FinerThanProject,
}

impl SkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Export => "export",
            SkipReason::FinerThanProject => "finer_than_project",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheDecision {
    Store,
    Skip(SkipReason),
}

#[derive(Clone, Debug)]
pub struct ResponseAssembler {
    export_marker: String,
    project_level: u32,
}

impl ResponseAssembler {
    pub fn new(export_marker: impl Into<String>, project_level: u32) -> Self {
        Self {
            export_marker: export_marker.into(),
            project_level,
        }
    }

    pub fn is_export(&self, request: &BatchRequest) -> bool {
        request.is_export(&self.export_marker)
    }

    /// Matches produced results 1:1 against the requested metrics.
    ///
    /// Requested metrics with a result come first, in request order. Each
    /// requested descriptor consumes one result, so a metric requested twice
    /// needs two results. Requested metrics without a result are appended as
    /// untouched placeholders. Results nobody asked for are dropped.
    pub fn reconcile(
        &self,
        requested: &[MetricDescriptor],
        produced: Vec<MetricResult>,
    ) -> Vec<MetricResult> {
        let mut by_metric: IndexMap<MetricId, VecDeque<MetricResult>> = IndexMap::new();
        for result in produced {
            by_metric
                .entry(result.metric_id.clone())
                .or_default()
                .push_back(result);
        }

        let mut response = Vec::with_capacity(requested.len());
        let mut missing = Vec::new();
        for metric in requested {
            match by_metric
                .get_mut(&metric.id)
                .and_then(|results| results.pop_front())
            {
                Some(result) => response.push(result),
                None => missing.push(metric),
            }
        }

        for metric in missing {
            tracing::warn!(metric = %metric.id, "No result produced for metric, adding placeholder");
            counter!(RESULTS_RECONCILED).increment(1);
            response.push(MetricResult::untouched(metric));
        }

        for (metric_id, extra) in by_metric.iter().filter(|(_, results)| !results.is_empty()) {
            tracing::warn!(
                metric = %metric_id,
                count = extra.len(),
                "Dropping results for metric that was not requested"
            );
        }

        response
    }

    pub fn cache_decision(&self, request: &BatchRequest) -> CacheDecision {
        if self.is_export(request) {
            CacheDecision::Skip(SkipReason::Export)
        } else if request.level.is_finer_than(self.project_level) {
            CacheDecision::Skip(SkipReason::FinerThanProject)
        } else {
            CacheDecision::Store
        }
    }
}
