//! Hierarchical project tree.
//!
//! The tree mirrors the organization → project → iteration structure of a
//! batch. Leaves carry raw per-entity attributes, internal nodes receive
//! aggregated values. A tree is built once per batch by the project
//! resolver and every metric task works on its own `deep_copy`, so a node
//! is never written by more than one task.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type NodeId = String;
pub type ProjectConfigId = String;

/// Position of a node in the hierarchy. Lower ranks are coarser.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HierarchyLevel {
    pub rank: u32,
    pub label: String,
}

impl HierarchyLevel {
    pub fn new(rank: u32, label: impl Into<String>) -> Self {
        Self {
            rank,
            label: label.into(),
        }
    }

    pub fn is_finer_than(&self, rank: u32) -> bool {
        self.rank > rank
    }
}

/// Project identity a node is filtered by. Shared read-only between copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterContext {
    pub project_key: String,
    pub project_config_id: ProjectConfigId,
    pub project_name: String,
}

/// A raw observation produced for a leaf
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl DataPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// One aggregated trend point
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketValue {
    pub label: String,
    pub start: NaiveDate,
    pub value: f64,
}

/// Payload of the node for the current computation stage, keyed by category
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NodeValue {
    #[default]
    Unset,
    Leaf(BTreeMap<String, Vec<DataPoint>>),
    Aggregated(BTreeMap<String, Vec<BucketValue>>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub level: HierarchyLevel,
    #[serde(default)]
    pub filter: Option<Arc<FilterContext>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub value: NodeValue,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, level: HierarchyLevel) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            filter: None,
            attributes: BTreeMap::new(),
            value: NodeValue::Unset,
            children: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterContext) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns an exclusive copy of this subtree.
    ///
    /// Every mutable part (value slot, attributes, children) is copied; the
    /// filter context is immutable and stays shared.
    pub fn deep_copy(&self) -> Node {
        Node {
            id: self.id.clone(),
            name: self.name.clone(),
            level: self.level.clone(),
            filter: self.filter.clone(),
            attributes: self.attributes.clone(),
            value: self.value.clone(),
            children: self.children.iter().map(Node::deep_copy).collect(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Node> {
        self.walk().find(|node| node.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Node> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    /// Pre-order traversal of the subtree, starting with `self`.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.walk().filter(|node| node.is_leaf())
    }

    pub fn at_level(&self, rank: u32) -> impl Iterator<Item = &Node> {
        self.walk().filter(move |node| node.level.rank == rank)
    }

    /// Distinct project config ids referenced anywhere in the subtree.
    pub fn project_config_ids(&self) -> Vec<ProjectConfigId> {
        self.walk()
            .filter_map(|node| node.filter.as_ref())
            .map(|filter| filter.project_config_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct project keys referenced anywhere in the subtree.
    pub fn project_keys(&self) -> BTreeSet<String> {
        self.walk()
            .filter_map(|node| node.filter.as_ref())
            .map(|filter| filter.project_key.clone())
            .collect()
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
