//! Parallel execution of the metrics of one batch.
//!
//! Every requested metric becomes one job on the shared worker pool. A job
//! resolves the metric's strategy, takes its own deep copy of the tree,
//! checks that the required tool is configured, runs the strategy and rolls
//! its leaf values up to the requested level. Whatever happens inside a job
//! (strategy error, missing strategy, panic) ends up on that metric's result
//! and never reaches sibling jobs.
//!
//! If the pool refuses the batch, the same jobs run one after the other on
//! the calling task.

use shared::{counter, histogram};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;

use crate::errors::StrategyError;
use crate::metrics_defs::{
    METRIC_TASK_DURATION, METRIC_TASK_FAILED, METRIC_TASK_SKIPPED, POOL_REJECTED,
};
use crate::node::Node;
use crate::pool::{MetricJob, SpawnedTasks, WorkerPool};
use crate::projects::ToolConfiguration;
use crate::reducer;
use crate::request::{BatchRequest, Bucket, MetricDescriptor};
use crate::result::{MetricPayload, MetricResult};
use crate::side_channel::SideChannelHandle;
use crate::strategy::{MetricStrategy, StrategyContext, StrategyRegistry};

/// Read-only inputs shared by every job of a batch
struct BatchInputs {
    request: Arc<BatchRequest>,
    tree: Arc<Node>,
    buckets: Vec<Bucket>,
    side_channel: SideChannelHandle,
    export: bool,
}

pub struct BatchExecutor {
    pool: Arc<dyn WorkerPool>,
    registry: Arc<StrategyRegistry>,
    tools: Arc<dyn ToolConfiguration>,
    task_timeout: Option<Duration>,
    export_marker: String,
}

impl BatchExecutor {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        registry: Arc<StrategyRegistry>,
        tools: Arc<dyn ToolConfiguration>,
        export_marker: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            registry,
            tools,
            task_timeout: None,
            export_marker: export_marker.into(),
        }
    }

    /// Bounds how long a batch waits for its metrics. Metrics still running
    /// at the deadline are reported as failed.
    pub fn with_task_timeout(mut self, task_timeout: Option<Duration>) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    /// Computes every metric of `request`. Results come back in no particular
    /// order and a metric whose task was lost may be missing.
    pub async fn execute(
        &self,
        request: Arc<BatchRequest>,
        tree: Arc<Node>,
        side_channel: SideChannelHandle,
    ) -> Vec<MetricResult> {
        let inputs = Arc::new(BatchInputs {
            buckets: request.buckets(),
            export: request.is_export(&self.export_marker),
            request: request.clone(),
            tree,
            side_channel,
        });

        let jobs: Vec<MetricJob> = request
            .metrics
            .iter()
            .map(|metric| self.build_job(metric.clone(), inputs.clone()))
            .collect();

        match self.pool.submit_all(jobs) {
            Ok(spawned) => self.collect_results(spawned).await,
            Err(rejected) => {
                tracing::warn!(
                    pool = self.pool.name(),
                    reason = rejected.reason.as_str(),
                    metrics = rejected.jobs.len(),
                    "Worker pool rejected batch, computing metrics sequentially"
                );
                counter!(POOL_REJECTED, "reason" => rejected.reason.as_str()).increment(1);
                rejected.jobs.into_iter().map(MetricJob::run).collect()
            }
        }
    }

    fn build_job(&self, metric: MetricDescriptor, inputs: Arc<BatchInputs>) -> MetricJob {
        let registry = self.registry.clone();
        let tools = self.tools.clone();
        MetricJob::new(metric.clone(), move || {
            run_metric(&metric, &inputs, &registry, tools.as_ref())
        })
    }

    /// Waits for all spawned jobs, or until the batch deadline.
    async fn collect_results(&self, spawned: SpawnedTasks) -> Vec<MetricResult> {
        let SpawnedTasks {
            mut join_set,
            mut task_metrics,
        } = spawned;
        let mut results = Vec::with_capacity(task_metrics.len());

        let has_deadline = self.task_timeout.is_some();
        let deadline = tokio::time::sleep_until(
            tokio::time::Instant::now() + self.task_timeout.unwrap_or_default(),
        );
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                Some(join_result) = join_set.join_next_with_id() => {
                    handle_task_completion(join_result, &mut task_metrics, &mut results);
                }
                _ = &mut deadline, if has_deadline => {
                    tracing::error!(
                        remaining = join_set.len(),
                        "Batch deadline reached, abandoning remaining metric tasks"
                    );
                    // Blocking jobs that already started cannot be interrupted;
                    // they finish in the background and their results are dropped.
                    join_set.abort_all();
                    while let Some(join_result) = join_set.try_join_next_with_id() {
                        if let Ok((id, result)) = join_result {
                            task_metrics.remove(&id);
                            results.push(result);
                        }
                    }
                    join_set.detach_all();
                    break;
                }
                else => break,
            }
        }

        for metric in task_metrics.into_values() {
            tracing::error!(metric = %metric.id, "Metric did not finish before the batch deadline");
            counter!(METRIC_TASK_FAILED, "metric" => metric.id.clone(), "reason" => "timeout")
                .increment(1);
            let mut result = MetricResult::untouched(&metric);
            result.fail();
            results.push(result);
        }

        results
    }
}

/// A task that was lost (cancelled or panicked outside the strategy guard)
/// leaves no result; the assembler fills in a placeholder for it.
fn handle_task_completion(
    join_result: Result<(tokio::task::Id, MetricResult), JoinError>,
    task_metrics: &mut HashMap<tokio::task::Id, MetricDescriptor>,
    results: &mut Vec<MetricResult>,
) {
    match join_result {
        Ok((id, result)) => {
            task_metrics.remove(&id);
            results.push(result);
        }
        Err(e) => {
            let metric = task_metrics.remove(&e.id());
            tracing::error!(
                metric = metric.as_ref().map(|m| m.id.as_str()).unwrap_or("unknown"),
                error = %e,
                "Metric task did not report a result"
            );
        }
    }
}

/// What became of one metric before it is written to its result
enum Outcome {
    Skipped,
    Passed(MetricPayload),
    Failed {
        reason: &'static str,
        error: String,
    },
}

fn run_metric(
    metric: &MetricDescriptor,
    inputs: &BatchInputs,
    registry: &StrategyRegistry,
    tools: &dyn ToolConfiguration,
) -> MetricResult {
    let started = Instant::now();
    let mut result = MetricResult::untouched(metric);

    // Collaborators run under the guard as well, so a panic fails the
    // metric the same way on every pool.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        evaluate(metric, inputs, registry, tools)
    }))
    .unwrap_or_else(|panic| Outcome::Failed {
        reason: "panic",
        error: StrategyError::Panicked(panic_message(panic.as_ref())).to_string(),
    });

    let status = match outcome {
        Outcome::Skipped => {
            tracing::debug!(metric = %metric.id, "Required tool not configured, skipping metric");
            counter!(METRIC_TASK_SKIPPED, "metric" => metric.id.clone()).increment(1);
            return result;
        }
        Outcome::Passed(payload) => {
            result.pass(payload);
            "passed"
        }
        Outcome::Failed { reason, error } => {
            tracing::error!(metric = %metric.id, reason, error = %error, "Metric computation failed");
            counter!(METRIC_TASK_FAILED, "metric" => metric.id.clone(), "reason" => reason)
                .increment(1);
            result.fail();
            "failed"
        }
    };

    histogram!(METRIC_TASK_DURATION, "metric" => metric.id.clone(), "status" => status)
        .record(started.elapsed().as_secs_f64());
    result
}

fn evaluate(
    metric: &MetricDescriptor,
    inputs: &BatchInputs,
    registry: &StrategyRegistry,
    tools: &dyn ToolConfiguration,
) -> Outcome {
    let strategy = match registry.lookup(&metric.id) {
        Ok(strategy) => strategy,
        Err(e) => {
            return Outcome::Failed {
                reason: "not_found",
                error: e.to_string(),
            };
        }
    };

    let mut subtree = inputs.tree.deep_copy();

    if !tools.is_tool_configured(metric, &subtree) {
        return Outcome::Skipped;
    }

    let bundle = inputs.side_channel.bundle();
    let ctx = StrategyContext {
        request: &inputs.request,
        metric,
        buckets: &inputs.buckets,
        side_channel: &bundle,
    };

    match compute(strategy.as_ref(), &ctx, &mut subtree, inputs.export) {
        Ok(payload) => Outcome::Passed(payload),
        Err(e) => Outcome::Failed {
            reason: "error",
            error: e.to_string(),
        },
    }
}

fn compute(
    strategy: &dyn MetricStrategy,
    ctx: &StrategyContext<'_>,
    subtree: &mut Node,
    export: bool,
) -> Result<MetricPayload, StrategyError> {
    let output = strategy.compute(ctx, subtree)?;

    if export {
        return Ok(MetricPayload::Export(output.export_rows));
    }

    let series = reducer::aggregate(
        subtree,
        output.leaf_values,
        strategy.aggregation(),
        ctx.buckets,
        ctx.request.level.rank,
    );
    Ok(MetricPayload::Series(series))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
