//! Side-channel data shared by every metric of one batch.
//!
//! The loader fetches three auxiliary collections concurrently and hands
//! them out through a `SideChannelScope`. The scope owns the batch's slot:
//! metric tasks read it through cloned `SideChannelHandle`s and dropping the
//! scope empties the slot, whether the batch returns normally, bails out
//! with an error or unwinds. A handle that outlives its batch only ever sees
//! an empty bundle.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;

use crate::errors::FetchError;
use crate::metrics_defs::{SIDE_CHANNEL_FETCH_DURATION, SIDE_CHANNEL_FETCH_FAILED};
use crate::node::ProjectConfigId;
use crate::request::DateRange;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub project_config_id: ProjectConfigId,
    pub revision: String,
    pub author: String,
    pub committed_on: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestRecord {
    pub project_config_id: ProjectConfigId,
    pub id: String,
    pub author: String,
    pub state: String,
    pub created_on: NaiveDate,
    #[serde(default)]
    pub merged_on: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Auxiliary collections of one batch. Collections that could not be
/// fetched are empty, never absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SideChannelBundle {
    pub commits: Vec<CommitRecord>,
    pub merge_requests: Vec<MergeRequestRecord>,
    pub assignees: Vec<Assignee>,
}

impl SideChannelBundle {
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.merge_requests.is_empty() && self.assignees.is_empty()
    }
}

/// Source of the auxiliary collections
#[async_trait]
pub trait SideChannelSource: Send + Sync {
    async fn fetch_commits(
        &self,
        projects: &[ProjectConfigId],
        range: &DateRange,
    ) -> Result<Vec<CommitRecord>, FetchError>;

    async fn fetch_merge_requests(
        &self,
        projects: &[ProjectConfigId],
        range: &DateRange,
    ) -> Result<Vec<MergeRequestRecord>, FetchError>;

    async fn fetch_assignees(
        &self,
        projects: &[ProjectConfigId],
        range: &DateRange,
    ) -> Result<Vec<Assignee>, FetchError>;
}

pub struct SideChannelLoader {
    source: Arc<dyn SideChannelSource>,
}

impl SideChannelLoader {
    pub fn new(source: Arc<dyn SideChannelSource>) -> Self {
        Self { source }
    }

    /// Fetches the three collections concurrently and waits for all of them.
    ///
    /// Never fails: a failed fetch leaves its collection empty and a failed
    /// join leaves all three empty.
    pub async fn load(&self, projects: Vec<ProjectConfigId>, range: DateRange) -> SideChannelScope {
        let started = Instant::now();
        let projects: Arc<[ProjectConfigId]> = projects.into();

        let commits = {
            let source = self.source.clone();
            let projects = projects.clone();
            tokio::spawn(async move { source.fetch_commits(&projects, &range).await })
        };
        let merge_requests = {
            let source = self.source.clone();
            let projects = projects.clone();
            tokio::spawn(async move { source.fetch_merge_requests(&projects, &range).await })
        };
        let assignees = {
            let source = self.source.clone();
            let projects = projects.clone();
            tokio::spawn(async move { source.fetch_assignees(&projects, &range).await })
        };

        let (commits, merge_requests, assignees) = tokio::join!(commits, merge_requests, assignees);
        let bundle = match join_all(commits, merge_requests, assignees) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Side-channel join failed, continuing with empty collections"
                );
                counter!(SIDE_CHANNEL_FETCH_FAILED, "collection" => "all").increment(1);
                SideChannelBundle::default()
            }
        };

        histogram!(SIDE_CHANNEL_FETCH_DURATION).record(started.elapsed().as_secs_f64());
        tracing::debug!(
            projects = projects.len(),
            commits = bundle.commits.len(),
            merge_requests = bundle.merge_requests.len(),
            assignees = bundle.assignees.len(),
            "Loaded side-channel data"
        );

        SideChannelScope::new(bundle)
    }
}

type FetchJoin<T> = Result<Result<Vec<T>, FetchError>, JoinError>;

fn join_all(
    commits: FetchJoin<CommitRecord>,
    merge_requests: FetchJoin<MergeRequestRecord>,
    assignees: FetchJoin<Assignee>,
) -> Result<SideChannelBundle, JoinError> {
    Ok(SideChannelBundle {
        commits: or_empty("commits", commits?),
        merge_requests: or_empty("merge_requests", merge_requests?),
        assignees: or_empty("assignees", assignees?),
    })
}

fn or_empty<T>(collection: &'static str, result: Result<Vec<T>, FetchError>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        tracing::warn!(collection, error = %e, "Side-channel fetch failed, using empty collection");
        counter!(SIDE_CHANNEL_FETCH_FAILED, "collection" => collection).increment(1);
        Vec::new()
    })
}

type Slot = RwLock<Option<Arc<SideChannelBundle>>>;

/// Owner of one batch's side-channel slot. Dropping it releases the bundle.
pub struct SideChannelScope {
    slot: Arc<Slot>,
}

impl SideChannelScope {
    pub fn new(bundle: SideChannelBundle) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(Arc::new(bundle)))),
        }
    }

    pub fn empty() -> Self {
        Self::new(SideChannelBundle::default())
    }

    pub fn handle(&self) -> SideChannelHandle {
        SideChannelHandle {
            slot: self.slot.clone(),
        }
    }
}

impl Drop for SideChannelScope {
    fn drop(&mut self) {
        if self.slot.write().take().is_some() {
            tracing::trace!("Released side-channel bundle");
        }
    }
}

/// Read access to a batch's side-channel bundle
#[derive(Clone)]
pub struct SideChannelHandle {
    slot: Arc<Slot>,
}

impl SideChannelHandle {
    /// Returns the bundle, or an empty one once the owning scope is gone.
    pub fn bundle(&self) -> Arc<SideChannelBundle> {
        self.slot.read().clone().unwrap_or_default()
    }

    pub fn is_released(&self) -> bool {
        self.slot.read().is_none()
    }
}
