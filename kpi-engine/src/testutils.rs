use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{FetchError, ResolveError, StrategyError};
use crate::node::{FilterContext, HierarchyLevel, Node, ProjectConfigId};
use crate::pool::{InlinePool, MetricJob, RejectReason, Rejected, SpawnedTasks, WorkerPool};
use crate::projects::{AccessibleProjects, ProjectResolver, ToolConfiguration};
use crate::request::{BatchRequest, DateRange, DurationUnit, MetricDescriptor, TrendWindow};
use crate::side_channel::{
    Assignee, CommitRecord, MergeRequestRecord, SideChannelSource,
};
use crate::strategy::{Aggregation, MetricStrategy, StrategyContext, StrategyOutput};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn project(key: &str, config_id: &str) -> FilterContext {
    FilterContext {
        project_key: key.into(),
        project_config_id: config_id.into(),
        project_name: format!("Project {key}"),
    }
}

fn sprint(id: &str, name: &str, filter: &FilterContext, issues: u32) -> Node {
    Node::new(id, name, HierarchyLevel::new(5, "sprint"))
        .with_filter(filter.clone())
        .with_attribute("issues", serde_json::json!(issues))
}

/// org ─┬─ p1 (P1, cfg-1) ─┬─ p1-s1 (3 issues)
///      │                  └─ p1-s2 (4 issues)
///      └─ p2 (P2, cfg-2) ─── p2-s1 (5 issues)
pub fn sample_tree() -> Node {
    let p1 = project("P1", "cfg-1");
    let p2 = project("P2", "cfg-2");

    Node::new("org", "Acme", HierarchyLevel::new(3, "account"))
        .with_child(
            Node::new("p1", "Project P1", HierarchyLevel::new(4, "project"))
                .with_filter(p1.clone())
                .with_child(sprint("p1-s1", "Sprint 1", &p1, 3))
                .with_child(sprint("p1-s2", "Sprint 2", &p1, 4)),
        )
        .with_child(
            Node::new("p2", "Project P2", HierarchyLevel::new(4, "project"))
                .with_filter(p2.clone())
                .with_child(sprint("p2-s1", "Sprint 1", &p2, 5)),
        )
}

/// Project level request over the last five days, one Jira metric per id.
pub fn sample_request(ids: &[&str]) -> BatchRequest {
    BatchRequest {
        metrics: ids
            .iter()
            .map(|id| MetricDescriptor::new(*id, *id, "Jira"))
            .collect(),
        level: HierarchyLevel::new(4, "project"),
        group_id: 1,
        window: TrendWindow {
            unit: DurationUnit::Day,
            data_points: 5,
        },
        as_of: date(2026, 10, 19),
        sprint_filter: vec!["CLOSED".into()],
        selected_ids: vec![],
        tracker_id: None,
        trust_project_cache: true,
    }
}

/// Reports the `issues` attribute of every leaf on the request's `as_of` day.
#[derive(Debug, Default)]
pub struct IssueCountStrategy;

impl MetricStrategy for IssueCountStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn compute(
        &self,
        ctx: &StrategyContext<'_>,
        subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        let mut output = StrategyOutput::default();
        for leaf in subtree.leaves() {
            let issues = leaf
                .attributes
                .get("issues")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| StrategyError::MissingData(format!("issues of {}", leaf.id)))?;
            output.push(&leaf.id, "Overall", ctx.request.as_of, issues);

            let mut row = BTreeMap::new();
            row.insert("sprint".to_string(), serde_json::json!(leaf.name));
            row.insert("issues".to_string(), serde_json::json!(issues));
            output.export_rows.push(row);
        }
        Ok(output)
    }
}

/// Counts the commits of each project on its first leaf.
#[derive(Debug, Default)]
pub struct CommitCountStrategy;

impl MetricStrategy for CommitCountStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn compute(
        &self,
        ctx: &StrategyContext<'_>,
        subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        let mut output = StrategyOutput::default();
        for commit in &ctx.side_channel.commits {
            let leaf = subtree.leaves().find(|leaf| {
                leaf.filter
                    .as_ref()
                    .is_some_and(|f| f.project_config_id == commit.project_config_id)
            });
            if let Some(leaf) = leaf {
                output.push(&leaf.id, "Overall", commit.committed_on, 1.0);
            }
        }
        Ok(output)
    }
}

#[derive(Debug, Default)]
pub struct FailingStrategy;

impl MetricStrategy for FailingStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn compute(
        &self,
        _ctx: &StrategyContext<'_>,
        subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        subtree.name = "half done".into();
        Err(StrategyError::Computation("division by zero".into()))
    }
}

#[derive(Debug, Default)]
pub struct PanickingStrategy;

impl MetricStrategy for PanickingStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn compute(
        &self,
        _ctx: &StrategyContext<'_>,
        _subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        panic!("strategy blew up");
    }
}

/// Marks every node of its copy and fails if a mark is already there.
#[derive(Debug, Default)]
pub struct MarkingStrategy;

impl MetricStrategy for MarkingStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Latest
    }

    fn compute(
        &self,
        ctx: &StrategyContext<'_>,
        subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        let ids: Vec<String> = subtree.walk().map(|node| node.id.clone()).collect();
        for id in ids {
            let Some(node) = subtree.find_mut(&id) else {
                continue;
            };
            if let Some(owner) = node.attributes.get("marked_by") {
                return Err(StrategyError::Computation(format!(
                    "{id} already marked by {owner}"
                )));
            }
            node.attributes
                .insert("marked_by".into(), serde_json::json!(ctx.metric.id));
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(StrategyOutput::default())
    }
}

/// Sleeps before producing an empty output.
#[derive(Debug)]
pub struct SlowStrategy(pub Duration);

impl MetricStrategy for SlowStrategy {
    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn compute(
        &self,
        _ctx: &StrategyContext<'_>,
        _subtree: &mut Node,
    ) -> Result<StrategyOutput, StrategyError> {
        std::thread::sleep(self.0);
        Ok(StrategyOutput::default())
    }
}

/// Side-channel source with fixed data: two commits, one merge request and
/// one assignee.
#[derive(Debug, Default)]
pub struct StaticSource {
    pub calls: AtomicUsize,
    pub fail_commits: bool,
    pub panic_assignees: bool,
}

#[async_trait]
impl SideChannelSource for StaticSource {
    async fn fetch_commits(
        &self,
        projects: &[ProjectConfigId],
        range: &DateRange,
    ) -> Result<Vec<CommitRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits {
            return Err(FetchError::Unavailable("connection refused".into()));
        }
        let project = projects.first().cloned().unwrap_or_default();
        Ok(vec![
            CommitRecord {
                project_config_id: project.clone(),
                revision: "a1".into(),
                author: "alex".into(),
                committed_on: range.end,
            },
            CommitRecord {
                project_config_id: project,
                revision: "a2".into(),
                author: "sam".into(),
                committed_on: range.start,
            },
        ])
    }

    async fn fetch_merge_requests(
        &self,
        projects: &[ProjectConfigId],
        range: &DateRange,
    ) -> Result<Vec<MergeRequestRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![MergeRequestRecord {
            project_config_id: projects.first().cloned().unwrap_or_default(),
            id: "mr-1".into(),
            author: "alex".into(),
            state: "MERGED".into(),
            created_on: range.start,
            merged_on: Some(range.end),
        }])
    }

    async fn fetch_assignees(
        &self,
        _projects: &[ProjectConfigId],
        _range: &DateRange,
    ) -> Result<Vec<Assignee>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_assignees {
            panic!("assignee directory crashed");
        }
        Ok(vec![Assignee {
            account_id: "u1".into(),
            display_name: "Alex".into(),
            email: Some("alex@example.com".into()),
        }])
    }
}

/// Resolves every request to `sample_tree`, remembering how it was called.
#[derive(Debug, Default)]
pub struct StaticResolver {
    pub calls: AtomicUsize,
    pub last_trust: Mutex<Option<bool>>,
    pub fail: bool,
}

#[async_trait]
impl ProjectResolver for StaticResolver {
    async fn resolve(
        &self,
        _request: &BatchRequest,
        trust_project_cache: bool,
    ) -> Result<AccessibleProjects, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_trust.lock() = Some(trust_project_cache);
        if self.fail {
            return Err(ResolveError::AccessDenied("no projects for user".into()));
        }
        Ok(AccessibleProjects::from_tree(sample_tree()))
    }
}

/// Refuses every submission as saturated.
#[derive(Debug, Default)]
pub struct RejectingPool {
    submissions: AtomicUsize,
}

impl RejectingPool {
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

impl WorkerPool for RejectingPool {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn submit_all(&self, jobs: Vec<MetricJob>) -> Result<SpawnedTasks, Rejected> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Err(Rejected {
            reason: RejectReason::Saturated,
            jobs,
        })
    }
}

/// Inline pool counting the jobs it runs.
#[derive(Debug, Default)]
pub struct CountingPool {
    jobs: AtomicUsize,
}

impl CountingPool {
    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }
}

impl WorkerPool for CountingPool {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn submit_all(&self, jobs: Vec<MetricJob>) -> Result<SpawnedTasks, Rejected> {
        self.jobs.fetch_add(jobs.len(), Ordering::SeqCst);
        InlinePool.submit_all(jobs)
    }
}

/// Every tool configured except the ones of the listed metrics.
#[derive(Debug, Default)]
pub struct ToolsExcept(HashSet<String>);

impl ToolsExcept {
    pub fn new(metrics: &[&str]) -> Self {
        Self(metrics.iter().map(|id| id.to_string()).collect())
    }
}

impl ToolConfiguration for ToolsExcept {
    fn is_tool_configured(&self, metric: &MetricDescriptor, _node: &Node) -> bool {
        !self.0.contains(&metric.id)
    }
}

/// Tool configuration whose lookup always panics.
#[derive(Debug, Default)]
pub struct PanickingTools;

impl ToolConfiguration for PanickingTools {
    fn is_tool_configured(&self, _metric: &MetricDescriptor, _node: &Node) -> bool {
        panic!("tool lookup failed");
    }
}
