//! Boundaries towards project access and tool configuration.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::ResolveError;
use crate::node::{Node, ProjectConfigId};
use crate::request::{BatchRequest, MetricDescriptor};

/// Projects the caller may see, as a tree, plus the key set used for caching
#[derive(Clone, Debug, PartialEq)]
pub struct AccessibleProjects {
    pub tree: Node,
    pub project_keys: BTreeSet<String>,
}

impl AccessibleProjects {
    pub fn from_tree(tree: Node) -> Self {
        let project_keys = tree.project_keys();
        Self { tree, project_keys }
    }
}

/// Applies authorization and hierarchy filtering to a request
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// `trust_project_cache` is false when any cached project identity must
    /// be ignored, e.g. for callers authenticated with an API key.
    async fn resolve(
        &self,
        request: &BatchRequest,
        trust_project_cache: bool,
    ) -> Result<AccessibleProjects, ResolveError>;
}

/// Whether the data source a metric needs is set up for a node
pub trait ToolConfiguration: Send + Sync {
    fn is_tool_configured(&self, metric: &MetricDescriptor, node: &Node) -> bool;
}

/// Treats every tool as configured everywhere
#[derive(Debug, Default)]
pub struct AllToolsConfigured;

impl ToolConfiguration for AllToolsConfigured {
    fn is_tool_configured(&self, _metric: &MetricDescriptor, _node: &Node) -> bool {
        true
    }
}

/// Tool categories configured per project.
///
/// A metric is computable for a node when at least one project under it has
/// the tool of the metric's category configured.
#[derive(Debug, Default)]
pub struct ConfiguredTools {
    by_project: HashMap<ProjectConfigId, HashSet<String>>,
}

impl ConfiguredTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, project: impl Into<ProjectConfigId>, category: impl Into<String>) -> Self {
        self.by_project
            .entry(project.into())
            .or_default()
            .insert(category.into());
        self
    }
}

impl ToolConfiguration for ConfiguredTools {
    fn is_tool_configured(&self, metric: &MetricDescriptor, node: &Node) -> bool {
        node.project_config_ids().iter().any(|project| {
            self.by_project
                .get(project)
                .is_some_and(|tools| tools.contains(&metric.category))
        })
    }
}
