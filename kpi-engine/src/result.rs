//! Per-metric response elements.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::node::{BucketValue, NodeId};
use crate::request::{MetricDescriptor, MetricId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricStatus {
    Passed,
    Failed,
}

/// Aggregated trend of one node for one category
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSeries {
    pub node_id: NodeId,
    pub node_name: String,
    pub category: String,
    pub points: Vec<BucketValue>,
}

pub type ExportRow = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MetricPayload {
    Series(Vec<NodeSeries>),
    Export(Vec<ExportRow>),
}

/// One response element per requested metric.
///
/// A result with no status was never touched by a task: either the tool the
/// metric depends on is not configured, or the task never reported back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub metric_id: MetricId,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub status: Option<MetricStatus>,
    #[serde(default)]
    pub payload: Option<MetricPayload>,
}

impl MetricResult {
    pub fn untouched(metric: &MetricDescriptor) -> Self {
        Self {
            metric_id: metric.id.clone(),
            name: metric.name.clone(),
            category: metric.category.clone(),
            status: None,
            payload: None,
        }
    }

    pub fn pass(&mut self, payload: MetricPayload) {
        self.status = Some(MetricStatus::Passed);
        self.payload = Some(payload);
    }

    /// Marks the metric as failed. Identity fields are kept and no payload is
    /// reported, even if the strategy produced part of one.
    pub fn fail(&mut self) {
        self.status = Some(MetricStatus::Failed);
        self.payload = None;
    }

    pub fn is_untouched(&self) -> bool {
        self.status.is_none() && self.payload.is_none()
    }
}
