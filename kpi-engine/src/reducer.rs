//! Roll-up of leaf values to the requested hierarchy level.
//!
//! Leaf points are first grouped into the trend buckets of the request,
//! then combined bottom-up with the metric's aggregation rule. Every node of
//! the tree ends up with one series per category covering every bucket; a
//! missing observation counts as zero.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::node::{BucketValue, DataPoint, Node, NodeId, NodeValue};
use crate::request::Bucket;
use crate::result::NodeSeries;
use crate::strategy::{Aggregation, LeafValues};

/// Category used when a strategy reports no values at all
pub const OVERALL: &str = "Overall";

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Cell {
    value: f64,
    /// Most recent observation that contributed to the value
    observed: Option<NaiveDate>,
}

type CategorySeries = BTreeMap<String, Vec<Cell>>;

/// Aggregates `leaf_values` over `root` and returns the series of every node
/// at `target_rank`.
///
/// Values reported for unknown or non-leaf nodes are ignored.
pub fn aggregate(
    root: &mut Node,
    leaf_values: LeafValues,
    rule: Aggregation,
    buckets: &[Bucket],
    target_rank: u32,
) -> Vec<NodeSeries> {
    let mut categories: BTreeSet<String> = leaf_values
        .keys()
        .map(|key| key.category.clone())
        .collect();
    if categories.is_empty() {
        categories.insert(OVERALL.to_string());
    }

    let mut by_leaf: HashMap<NodeId, BTreeMap<String, Vec<DataPoint>>> = HashMap::new();
    for (key, points) in leaf_values {
        by_leaf
            .entry(key.node_id)
            .or_default()
            .insert(key.category, points);
    }

    let reducer = Reducer {
        rule,
        buckets,
        categories: &categories,
    };
    reducer.fold(root, &mut by_leaf);

    if !by_leaf.is_empty() {
        tracing::debug!(
            nodes = ?by_leaf.keys().collect::<Vec<_>>(),
            "Ignoring values reported for unknown or non-leaf nodes"
        );
    }

    collect_series(root, target_rank)
}

struct Reducer<'a> {
    rule: Aggregation,
    buckets: &'a [Bucket],
    categories: &'a BTreeSet<String>,
}

impl Reducer<'_> {
    fn fold(
        &self,
        node: &mut Node,
        by_leaf: &mut HashMap<NodeId, BTreeMap<String, Vec<DataPoint>>>,
    ) -> CategorySeries {
        let series: CategorySeries = if node.is_leaf() {
            let raw = by_leaf.remove(&node.id).unwrap_or_default();
            self.categories
                .iter()
                .map(|category| {
                    let points = raw.get(category).map(Vec::as_slice).unwrap_or_default();
                    (category.clone(), self.bucketize(points))
                })
                .collect()
        } else {
            let children: Vec<CategorySeries> = node
                .children
                .iter_mut()
                .map(|child| self.fold(child, by_leaf))
                .collect();
            self.categories
                .iter()
                .map(|category| {
                    let cells: Vec<&Vec<Cell>> =
                        children.iter().map(|child| &child[category]).collect();
                    (category.clone(), self.combine(&cells))
                })
                .collect()
        };

        node.value = NodeValue::Aggregated(
            series
                .iter()
                .map(|(category, cells)| (category.clone(), self.to_bucket_values(cells)))
                .collect(),
        );
        series
    }

    /// Groups the points of one leaf into buckets.
    fn bucketize(&self, points: &[DataPoint]) -> Vec<Cell> {
        let mut grouped: Vec<Vec<&DataPoint>> = vec![Vec::new(); self.buckets.len()];
        for point in points {
            if let Some(index) = self.bucket_index(point.date) {
                grouped[index].push(point);
            }
        }

        grouped
            .into_iter()
            .map(|points| {
                let observed = points.iter().map(|point| point.date).max();
                let value = match self.rule {
                    Aggregation::Sum => total(points.iter().map(|point| point.value)),
                    Aggregation::Average if points.is_empty() => 0.0,
                    Aggregation::Average => {
                        total(points.iter().map(|point| point.value)) / points.len() as f64
                    }
                    Aggregation::Latest => points
                        .iter()
                        .max_by_key(|point| point.date)
                        .map(|point| point.value)
                        .unwrap_or_default(),
                };
                Cell { value, observed }
            })
            .collect()
    }

    /// Combines the bucket series of sibling nodes.
    fn combine(&self, children: &[&Vec<Cell>]) -> Vec<Cell> {
        (0..self.buckets.len())
            .map(|index| {
                let cells = children.iter().map(|series| series[index]);
                let observed = cells.clone().filter_map(|cell| cell.observed).max();
                let value = match self.rule {
                    Aggregation::Sum => total(cells.map(|cell| cell.value)),
                    Aggregation::Average if children.is_empty() => 0.0,
                    Aggregation::Average => {
                        total(cells.map(|cell| cell.value)) / children.len() as f64
                    }
                    Aggregation::Latest => cells
                        .max_by_key(|cell| cell.observed)
                        .map(|cell| cell.value)
                        .unwrap_or_default(),
                };
                Cell { value, observed }
            })
            .collect()
    }

    fn bucket_index(&self, date: NaiveDate) -> Option<usize> {
        let candidates = self.buckets.partition_point(|bucket| bucket.start <= date);
        let index = candidates.checked_sub(1)?;
        self.buckets[index].contains(date).then_some(index)
    }

    fn to_bucket_values(&self, cells: &[Cell]) -> Vec<BucketValue> {
        self.buckets
            .iter()
            .zip(cells)
            .map(|(bucket, cell)| BucketValue {
                label: bucket.label.clone(),
                start: bucket.start,
                value: cell.value,
            })
            .collect()
    }
}

/// Sum starting from positive zero, so empty buckets never report `-0.0`.
fn total(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, |acc, value| acc + value)
}

fn collect_series(root: &Node, target_rank: u32) -> Vec<NodeSeries> {
    root.at_level(target_rank)
        .flat_map(|node| match &node.value {
            NodeValue::Aggregated(series) => series
                .iter()
                .map(|(category, points)| NodeSeries {
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    category: category.clone(),
                    points: points.clone(),
                })
                .collect(),
            _ => Vec::new(),
        })
        .collect()
}
