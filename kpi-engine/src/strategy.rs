//! Metric strategies and the registry resolving them.
//!
//! A strategy is the formula of one metric. It reads the raw attributes of
//! its private tree copy plus the batch's side-channel data and reports
//! dated values per leaf; the engine takes care of bucketing and roll-up.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{StrategyError, StrategyNotFound};
use crate::node::{DataPoint, Node, NodeId};
use crate::request::{BatchRequest, Bucket, MetricDescriptor, MetricId};
use crate::result::ExportRow;
use crate::side_channel::SideChannelBundle;

/// How values of one bucket are combined, within a leaf and across children
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Average,
    Latest,
}

/// Identifies the values of one leaf for one category
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafKey {
    pub node_id: NodeId,
    pub category: String,
}

impl LeafKey {
    pub fn new(node_id: impl Into<NodeId>, category: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            category: category.into(),
        }
    }
}

pub type LeafValues = HashMap<LeafKey, Vec<DataPoint>>;

#[derive(Debug, Default)]
pub struct StrategyOutput {
    pub leaf_values: LeafValues,
    /// Rows returned instead of the aggregated series for export requests
    pub export_rows: Vec<ExportRow>,
}

impl StrategyOutput {
    pub fn push(&mut self, node_id: &str, category: &str, date: NaiveDate, value: f64) {
        self.leaf_values
            .entry(LeafKey::new(node_id, category))
            .or_default()
            .push(DataPoint::new(date, value));
    }
}

/// Everything a strategy may read besides its tree copy
pub struct StrategyContext<'a> {
    pub request: &'a BatchRequest,
    pub metric: &'a MetricDescriptor,
    pub buckets: &'a [Bucket],
    pub side_channel: &'a SideChannelBundle,
}

pub trait MetricStrategy: Send + Sync {
    fn aggregation(&self) -> Aggregation;

    /// Computes leaf values for `subtree`, which is exclusively owned by the
    /// calling task and may be written freely.
    fn compute(
        &self,
        ctx: &StrategyContext<'_>,
        subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError>;
}

/// Explicit mapping from metric id to its strategy
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<MetricId, Arc<dyn MetricStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy, returning the one it replaces.
    pub fn register(
        &mut self,
        id: impl Into<MetricId>,
        strategy: Arc<dyn MetricStrategy>,
    ) -> Option<Arc<dyn MetricStrategy>> {
        self.strategies.insert(id.into(), strategy)
    }

    pub fn with(mut self, id: impl Into<MetricId>, strategy: Arc<dyn MetricStrategy>) -> Self {
        self.register(id, strategy);
        self
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<dyn MetricStrategy>, StrategyNotFound> {
        self.strategies
            .get(id)
            .cloned()
            .ok_or_else(|| StrategyNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&MetricId> = self.strategies.keys().collect();
        ids.sort();
        f.debug_struct("StrategyRegistry").field("metrics", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FailingStrategy, IssueCountStrategy};

    #[test]
    fn test_lookup() {
        let registry = StrategyRegistry::new()
            .with("kpi1", Arc::new(IssueCountStrategy))
            .with("kpi2", Arc::new(FailingStrategy));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("kpi1").unwrap().aggregation(), Aggregation::Sum);
        assert_eq!(
            registry.lookup("kpi9").err(),
            Some(StrategyNotFound("kpi9".to_string()))
        );
        assert_eq!(format!("{registry:?}"), r#"StrategyRegistry { metrics: ["kpi1", "kpi2"] }"#);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = StrategyRegistry::new();
        assert!(registry.register("kpi1", Arc::new(FailingStrategy)).is_none());
        assert!(
            registry
                .register("kpi1", Arc::new(IssueCountStrategy))
                .is_some()
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_output_groups_points_by_leaf_and_category() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut output = StrategyOutput::default();
        output.push("s1", "Bug", date, 1.0);
        output.push("s1", "Bug", date, 2.0);
        output.push("s1", "Story", date, 5.0);

        assert_eq!(output.leaf_values.len(), 2);
        assert_eq!(output.leaf_values[&LeafKey::new("s1", "Bug")].len(), 2);
    }
}
