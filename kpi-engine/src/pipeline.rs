//! The batch request pipeline.
//!
//! `process` resolves the projects the caller may see, serves the batch from
//! the result cache when possible and otherwise loads the side-channel data,
//! fans the metrics out to the worker pool, reconciles the results with the
//! request and stores the response for the next identical request.

use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::Instant;

use crate::assembler::{CacheDecision, ResponseAssembler};
use crate::cache::{CacheKey, ResultCache};
use crate::config::Config;
use crate::errors::Result;
use crate::executor::BatchExecutor;
use crate::metrics_defs::{
    BATCH_DURATION, BATCHES_INFLIGHT, RESULT_CACHE_HIT, RESULT_CACHE_MISS, RESULT_CACHE_SKIPPED,
};
use crate::pool::WorkerPool;
use crate::projects::{ProjectResolver, ToolConfiguration};
use crate::request::BatchRequest;
use crate::result::MetricResult;
use crate::side_channel::{SideChannelLoader, SideChannelSource};
use crate::strategy::StrategyRegistry;

/// External services a pipeline depends on
pub struct Collaborators {
    pub resolver: Arc<dyn ProjectResolver>,
    pub registry: Arc<StrategyRegistry>,
    pub tools: Arc<dyn ToolConfiguration>,
    pub source: Arc<dyn SideChannelSource>,
    pub cache: Arc<dyn ResultCache>,
    pub pool: Arc<dyn WorkerPool>,
}

pub struct BatchPipeline {
    resolver: Arc<dyn ProjectResolver>,
    cache: Arc<dyn ResultCache>,
    loader: SideChannelLoader,
    executor: BatchExecutor,
    assembler: ResponseAssembler,
}

impl BatchPipeline {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            resolver,
            registry,
            tools,
            source,
            cache,
            pool,
        } = collaborators;

        BatchPipeline {
            resolver,
            cache,
            loader: SideChannelLoader::new(source),
            executor: BatchExecutor::new(pool, registry, tools, config.export_marker.clone())
                .with_task_timeout(config.task_timeout()),
            assembler: ResponseAssembler::new(config.export_marker.clone(), config.project_level),
        }
    }

    /// Computes every requested metric. The response has exactly one entry
    /// per requested metric; per-metric problems are reported on the entries.
    pub async fn process(&self, request: BatchRequest) -> Result<Vec<MetricResult>> {
        self.run(request, true).await
    }

    /// Like `process`, but the resolver must not rely on its cached project
    /// identities.
    pub async fn process_with_bypassed_cache(
        &self,
        request: BatchRequest,
    ) -> Result<Vec<MetricResult>> {
        self.run(request, false).await
    }

    async fn run(&self, request: BatchRequest, trust_cache: bool) -> Result<Vec<MetricResult>> {
        let started = Instant::now();
        let _inflight = InflightGuard::new();

        let outcome = self.run_inner(request, trust_cache).await;
        let label = match &outcome {
            Ok((_, served_from_cache)) if *served_from_cache => "cached",
            Ok(_) => "computed",
            Err(_) => "error",
        };
        histogram!(BATCH_DURATION, "outcome" => label).record(started.elapsed().as_secs_f64());

        outcome.map(|(results, _)| results)
    }

    /// Returns the response and whether it came from the cache.
    async fn run_inner(
        &self,
        request: BatchRequest,
        trust_cache: bool,
    ) -> Result<(Vec<MetricResult>, bool)> {
        let trust_project_cache = request.trust_project_cache && trust_cache;
        let projects = self.resolver.resolve(&request, trust_project_cache).await?;

        let decision = self.assembler.cache_decision(&request);
        let key = CacheKey::new(&projects.project_keys, &request);

        match decision {
            CacheDecision::Store => {
                if let Some(cached) = self.cache.get(&key).await {
                    tracing::debug!(key = %key, metrics = cached.len(), "Serving batch from result cache");
                    counter!(RESULT_CACHE_HIT).increment(1);
                    return Ok((cached, true));
                }
                counter!(RESULT_CACHE_MISS).increment(1);
            }
            CacheDecision::Skip(reason) => {
                tracing::debug!(reason = reason.as_str(), "Result cache bypassed");
                counter!(RESULT_CACHE_SKIPPED, "reason" => reason.as_str()).increment(1);
            }
        }

        let request = Arc::new(request);
        let tree = Arc::new(projects.tree);

        let produced = {
            let scope = self
                .loader
                .load(tree.project_config_ids(), request.date_range())
                .await;
            self.executor
                .execute(request.clone(), tree, scope.handle())
                .await
        };

        let response = self.assembler.reconcile(&request.metrics, produced);

        if decision == CacheDecision::Store {
            self.cache.set(key, response.clone()).await;
        }

        Ok((response, false))
    }
}

/// Tracks the number of batches in flight for as long as it is alive
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(BATCHES_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(BATCHES_INFLIGHT).decrement(1.0);
    }
}
