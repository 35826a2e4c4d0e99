//! Metrics definitions for the kpi engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const BATCH_DURATION: MetricDef = MetricDef {
    name: "batch.duration",
    metric_type: MetricType::Histogram,
    description: "Batch duration in seconds. Tagged with outcome.",
};

pub const BATCHES_INFLIGHT: MetricDef = MetricDef {
    name: "batches.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of batches currently being processed",
};

pub const RESULT_CACHE_HIT: MetricDef = MetricDef {
    name: "result_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of batches served from the result cache",
};

pub const RESULT_CACHE_MISS: MetricDef = MetricDef {
    name: "result_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of cache lookups that missed",
};

pub const RESULT_CACHE_SKIPPED: MetricDef = MetricDef {
    name: "result_cache.skipped",
    metric_type: MetricType::Counter,
    description: "Number of batches that bypassed the result cache. Tagged with reason.",
};

pub const METRIC_TASK_DURATION: MetricDef = MetricDef {
    name: "metric_task.duration",
    metric_type: MetricType::Histogram,
    description: "Time to compute a single metric in seconds. Tagged with metric, status.",
};

pub const METRIC_TASK_FAILED: MetricDef = MetricDef {
    name: "metric_task.failed",
    metric_type: MetricType::Counter,
    description: "Number of metric tasks that failed. Tagged with metric, reason.",
};

pub const METRIC_TASK_SKIPPED: MetricDef = MetricDef {
    name: "metric_task.skipped",
    metric_type: MetricType::Counter,
    description: "Number of metric tasks skipped because the required tool is not configured",
};

pub const POOL_REJECTED: MetricDef = MetricDef {
    name: "pool.rejected",
    metric_type: MetricType::Counter,
    description: "Number of batches the worker pool rejected and that ran sequentially",
};

pub const SIDE_CHANNEL_FETCH_DURATION: MetricDef = MetricDef {
    name: "side_channel.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to load all side-channel collections of a batch in seconds",
};

pub const SIDE_CHANNEL_FETCH_FAILED: MetricDef = MetricDef {
    name: "side_channel.fetch.failed",
    metric_type: MetricType::Counter,
    description: "Number of side-channel fetches that degraded to empty. Tagged with collection.",
};

pub const RESULTS_RECONCILED: MetricDef = MetricDef {
    name: "results.reconciled",
    metric_type: MetricType::Counter,
    description: "Number of placeholder results appended for metrics that never reported back",
};

pub const ALL_METRICS: &[MetricDef] = &[
    BATCH_DURATION,
    BATCHES_INFLIGHT,
    RESULT_CACHE_HIT,
    RESULT_CACHE_MISS,
    RESULT_CACHE_SKIPPED,
    METRIC_TASK_DURATION,
    METRIC_TASK_FAILED,
    METRIC_TASK_SKIPPED,
    POOL_REJECTED,
    SIDE_CHANNEL_FETCH_DURATION,
    SIDE_CHANNEL_FETCH_FAILED,
    RESULTS_RECONCILED,
];
