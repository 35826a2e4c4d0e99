//! Result cache holding fully assembled batches, keyed by what determines
//! their content.

use async_trait::async_trait;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::request::{BatchRequest, MetricId, TrendWindow};
use crate::result::MetricResult;

/// Identifies a cached batch. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    project_keys: Vec<String>,
    sources: Vec<String>,
    group_id: u32,
    level_rank: u32,
    window: TrendWindow,
    as_of: NaiveDate,
    sprint_filter: Vec<String>,
    metric_ids: Vec<MetricId>,
    digest: String,
}

impl CacheKey {
    pub fn new(project_keys: &BTreeSet<String>, request: &BatchRequest) -> Self {
        let project_keys: Vec<String> = project_keys.iter().cloned().collect();
        let sources: Vec<String> = request
            .metrics
            .iter()
            .map(|metric| metric.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let sprint_filter: Vec<String> = request
            .sprint_filter
            .iter()
            .map(|state| state.to_uppercase())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let metric_ids: Vec<MetricId> = request.metrics.iter().map(|m| m.id.clone()).collect();

        let mut hasher = Sha256::new();
        for part in [&project_keys, &sources, &sprint_filter, &metric_ids] {
            hasher.update(part.join("\u{1f}").as_bytes());
            hasher.update(b"\x1e");
        }
        hasher.update(request.group_id.to_be_bytes());
        hasher.update(request.level.rank.to_be_bytes());
        hasher.update(format!("{:?}", request.window.unit).as_bytes());
        hasher.update((request.window.data_points as u64).to_be_bytes());
        hasher.update(request.as_of.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        CacheKey {
            project_keys,
            sources,
            group_id: request.group_id,
            level_rank: request.level.rank,
            window: request.window,
            as_of: request.as_of,
            sprint_filter,
            metric_ids,
            digest,
        }
    }

    /// Stable textual form, suitable for external key/value stores.
    pub fn as_str(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<Vec<MetricResult>>;

    async fn set(&self, key: CacheKey, results: Vec<MetricResult>);
}

/// Bounded in-process cache with a time-to-live
pub struct InMemoryResultCache {
    cache: Cache<CacheKey, Arc<Vec<MetricResult>>>,
}

impl InMemoryResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        InMemoryResultCache { cache }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Option<Vec<MetricResult>> {
        self.cache.get(key).map(|results| results.as_ref().clone())
    }

    async fn set(&self, key: CacheKey, results: Vec<MetricResult>) {
        self.cache.insert(key, Arc::new(results));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::HierarchyLevel;
    use crate::request::{DurationUnit, MetricDescriptor};
    use crate::testutils::sample_request;

    fn keys(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_key_ignores_ordering_of_sets() {
        let mut first = sample_request(&["kpi1", "kpi2"]);
        first.sprint_filter = vec!["closed".into(), "ACTIVE".into()];
        let mut second = first.clone();
        second.sprint_filter = vec!["ACTIVE".into(), "CLOSED".into()];

        let a = CacheKey::new(&keys(&["P2", "P1"]), &first);
        let b = CacheKey::new(&keys(&["P1", "P2"]), &second);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.to_string());
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_key_components_matter() {
        let request = sample_request(&["kpi1", "kpi2"]);
        let base = CacheKey::new(&keys(&["P1"]), &request);

        let mut other_group = request.clone();
        other_group.group_id += 1;
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_group));

        assert_ne!(base, CacheKey::new(&keys(&["P1", "P2"]), &request));

        let mut other_metrics = request.clone();
        other_metrics
            .metrics
            .push(MetricDescriptor::new("kpi3", "Sprint Velocity", "Jira"));
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_metrics));

        let mut other_level = request.clone();
        other_level.level = HierarchyLevel::new(3, "account");
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_level));

        let mut other_window = request.clone();
        other_window.window.data_points += 1;
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_window));

        let mut other_unit = request.clone();
        other_unit.window.unit = DurationUnit::Week;
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_unit));

        let mut other_day = request.clone();
        other_day.as_of = other_day.as_of.succ_opt().unwrap();
        let moved = CacheKey::new(&keys(&["P1"]), &other_day);
        assert_ne!(base, moved);
        assert_ne!(base.as_str(), moved.as_str());

        let mut other_filter = request.clone();
        other_filter.sprint_filter = vec!["ACTIVE".into()];
        assert_ne!(base, CacheKey::new(&keys(&["P1"]), &other_filter));
    }

    #[tokio::test]
    async fn test_in_memory_cache() {
        let cache = InMemoryResultCache::new(&CacheConfig::default());
        let request = sample_request(&["kpi1"]);
        let key = CacheKey::new(&keys(&["P1"]), &request);

        assert!(cache.get(&key).await.is_none());

        let results = vec![MetricResult::untouched(&request.metrics[0])];
        cache.set(key.clone(), results.clone()).await;
        assert_eq!(cache.get(&key).await, Some(results));

        cache.invalidate_all();
        assert!(cache.get(&key).await.is_none());
    }
}
